use std::fmt;
use std::str;

use bytes::{BufMut, Bytes};
use itertools::Itertools;

use crate::frame::Frame;
use crate::Error;

/// A request to the server: the command name followed by its arguments.
///
/// Clients send commands to the Redis server as RESP arrays of bulk strings. Every argument is
/// length prefixed, so arguments may hold arbitrary bytes.
///
/// ```
/// use rustdis_client::command::Command;
///
/// let cmd = Command::new("SET").arg("counter").arg(10);
/// assert_eq!(cmd.serialize(), b"*3\r\n$3\r\nSET\r\n$7\r\ncounter\r\n$2\r\n10\r\n");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Self {
        Self {
            args: vec![name.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    /// Upper-cased command name.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_uppercase()
    }

    /// The arguments following the command name.
    pub fn params(&self) -> &[Bytes] {
        &self.args[1..]
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    /// `*<argc>\r\n` followed by one bulk string per argument.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(b'*');
        dst.put_slice(self.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");

        for arg in &self.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    pub(crate) fn is(&self, name: &str) -> bool {
        self.args[0].eq_ignore_ascii_case(name.as_bytes())
    }

    pub fn is_subscribe(&self) -> bool {
        self.is("SUBSCRIBE") || self.is("PSUBSCRIBE")
    }

    pub fn is_unsubscribe(&self) -> bool {
        self.is("UNSUBSCRIBE") || self.is("PUNSUBSCRIBE")
    }

    /// Whether the command may be sent by a RESP2 connection in subscriber mode.
    pub fn allowed_in_subscribed_mode(&self) -> bool {
        self.is_subscribe()
            || self.is_unsubscribe()
            || self.is("PING")
            || self.is("QUIT")
            || self.is("RESET")
    }
}

impl From<Command> for Frame {
    fn from(cmd: Command) -> Self {
        Frame::Array(cmd.args.into_iter().map(Frame::Bulk).collect())
    }
}

impl TryFrom<Frame> for Command {
    type Error = Error;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let frames = match frame {
            Frame::Array(array) if !array.is_empty() => array,
            frame => return Err(Error::UnexpectedReply(frame)),
        };

        let args = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bulk(bytes) => Ok(bytes),
                Frame::Simple(s) => Ok(Bytes::from(s)),
                Frame::Integer(i) => Ok(i.to_arg()),
                frame => Err(Error::UnexpectedReply(frame)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { args })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.args
                .iter()
                .map(|arg| String::from_utf8_lossy(arg))
                .join(" ")
        )
    }
}

/// Conversion of a value into a single command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        if self.is_infinite() {
            let repr = if self.is_sign_positive() { "+inf" } else { "-inf" };
            return Bytes::from_static(repr.as_bytes());
        }
        Bytes::from(self.to_string())
    }
}

macro_rules! integer_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

integer_to_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_command() {
        let cmd = Command::new("GET").arg("foo");

        assert_eq!(cmd.serialize(), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    }

    #[test]
    fn encode_binary_argument() {
        let cmd = Command::new("SET").arg("k").arg(&b"a\r\nb"[..]);

        assert_eq!(
            cmd.serialize(),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\na\r\nb\r\n".to_vec()
        );
    }

    #[test]
    fn encoded_command_decodes_as_an_array_of_bulk_strings() {
        let cmd = Command::new("MSET").args(["a", "1", "b", "2"]);

        let (frame, consumed) = Frame::decode(&cmd.serialize()).unwrap();

        assert_eq!(consumed, cmd.serialize().len());
        assert_eq!(frame, Frame::from(cmd.clone()));
        assert_eq!(Command::try_from(frame).unwrap(), cmd);
    }

    #[test]
    fn parse_command_from_mixed_frames() {
        let frame = Frame::Array(vec![
            Frame::Simple(String::from("set")),
            Frame::Bulk(Bytes::from("foo")),
            Frame::Integer(3),
        ]);

        let cmd = Command::try_from(frame).unwrap();

        assert_eq!(cmd, Command::new("set").arg("foo").arg(3));
        assert_eq!(cmd.name(), "SET");
        assert_eq!(cmd.params(), &[Bytes::from("foo"), Bytes::from("3")]);
    }

    #[test]
    fn parse_command_rejects_non_arrays() {
        assert!(Command::try_from(Frame::Simple("GET".to_string())).is_err());
        assert!(Command::try_from(Frame::Array(vec![])).is_err());
    }

    #[test]
    fn classification() {
        assert!(Command::new("subscribe").arg("foo").is_subscribe());
        assert!(Command::new("PUNSUBSCRIBE").is_unsubscribe());
        assert!(Command::new("ping").allowed_in_subscribed_mode());
        assert!(!Command::new("GET").arg("k").allowed_in_subscribed_mode());
    }

    #[test]
    fn float_arguments() {
        assert_eq!(1.5f64.to_arg(), Bytes::from("1.5"));
        assert_eq!(f64::NEG_INFINITY.to_arg(), Bytes::from("-inf"));
    }

    #[test]
    fn display() {
        let cmd = Command::new("SET").arg("key").arg(1);
        assert_eq!(cmd.to_string(), "SET key 1");
    }
}
