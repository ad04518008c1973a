//! Subscribe command async parser

use crate::{RespError, MAX_CMD_NUM, MIN_CMD_NUM};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default maximum bytes accepted for one command frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Async parser for `*<argc>` / `$<len>` command frames
///
/// The parser owns a buffered reader; after a command has been parsed the
/// same reader keeps serving the heartbeat bytes of that connection so no
/// buffered input is lost.
pub struct AsyncCommandParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
    bytes_read: usize,
}

impl<R: AsyncRead + Unpin> AsyncCommandParser<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a parser with an explicit frame size limit
    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            bytes_read: 0,
        }
    }

    fn check_frame_size(&mut self, additional: usize) -> Result<(), RespError> {
        self.bytes_read = self.bytes_read.saturating_add(additional);
        if self.bytes_read > self.max_bytes {
            Err(RespError::FrameTooLarge(self.bytes_read, self.max_bytes))
        } else {
            Ok(())
        }
    }

    /// Parse one command frame into its string arguments
    pub async fn parse_command(&mut self) -> Result<Vec<String>, RespError> {
        self.bytes_read = 0;
        let argc = self.parse_size(b'*').await?;
        if argc < MIN_CMD_NUM || argc > MAX_CMD_NUM {
            return Err(RespError::Protocol(format!(
                "argument number {} out of range",
                argc
            )));
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let len = self.parse_size(b'$').await?;
            let data = self.parse_data(len).await?;
            let arg = String::from_utf8(data)
                .map_err(|_| RespError::Protocol("argument is not utf-8".to_string()))?;
            args.push(arg);
        }
        Ok(args)
    }

    /// Read one byte from the connection (heartbeat loop)
    pub async fn read_byte(&mut self) -> Result<u8, RespError> {
        match self.reader.read_u8().await {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(RespError::UnexpectedEof)
            }
            Err(e) => Err(RespError::Io(e)),
        }
    }

    /// Give back the underlying buffered reader
    pub fn into_inner(self) -> BufReader<R> {
        self.reader
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, RespError> {
        // one byte past the limit is enough to report the frame as too large
        let budget = self.max_bytes.saturating_sub(self.bytes_read) + 1;
        let mut line = Vec::new();
        let n = (&mut self.reader)
            .take(budget as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        self.check_frame_size(n)?;
        if line.last() != Some(&b'\n') {
            return Err(RespError::UnexpectedEof);
        }
        Ok(line)
    }

    /// `<prefix><number>\r\n`
    async fn parse_size(&mut self, prefix: u8) -> Result<usize, RespError> {
        let line = self.read_line().await?;
        let len = line.len();
        if len <= 3 || line[0] != prefix || line[len - 2] != b'\r' {
            return Err(RespError::Protocol(format!(
                "bad size line {:?}, expect prefix '{}'",
                String::from_utf8_lossy(&line),
                prefix as char
            )));
        }
        std::str::from_utf8(&line[1..len - 2])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                RespError::Protocol(format!(
                    "size is not a number: {:?}",
                    String::from_utf8_lossy(&line[1..len - 2])
                ))
            })
    }

    /// `<len bytes>\r\n`
    async fn parse_data(&mut self, len: usize) -> Result<Vec<u8>, RespError> {
        let mut line = self.read_line().await?;
        let n = line.len();
        if n != len + 2 || line[n - 2] != b'\r' {
            return Err(RespError::Protocol(format!(
                "data length {} does not match declared {}",
                n.saturating_sub(2),
                len
            )));
        }
        line.truncate(len);
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio_test::io::Builder;

    async fn parse(input: &[u8]) -> Result<Vec<String>, RespError> {
        let mut parser = AsyncCommandParser::new(Cursor::new(input.to_vec()));
        parser.parse_command().await
    }

    #[tokio::test]
    async fn test_parse_sub_command() {
        let args = parse(b"*3\r\n$3\r\nsub\r\n$5\r\nalice\r\n$2\r\n30\r\n")
            .await
            .unwrap();
        assert_eq!(args, vec!["sub", "alice", "30"]);
    }

    #[tokio::test]
    async fn test_parse_split_reads() {
        let reader = Builder::new()
            .read(b"*2\r")
            .read(b"\n$3\r\nsu")
            .read(b"b\r\n$3\r\nbob\r\n")
            .build();
        let mut parser = AsyncCommandParser::new(reader);
        assert_eq!(parser.parse_command().await.unwrap(), vec!["sub", "bob"]);
    }

    #[tokio::test]
    async fn test_parse_argc_bounds() {
        assert!(matches!(parse(b"*0\r\n").await, Err(RespError::Protocol(_))));
        assert!(matches!(parse(b"*6\r\n").await, Err(RespError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_parse_bad_prefix() {
        let err = parse(b"*1\r\n#3\r\nsub\r\n").await.unwrap_err();
        assert!(matches!(err, RespError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_parse_missing_cr() {
        assert!(matches!(parse(b"*1\n").await, Err(RespError::Protocol(_))));
        let err = parse(b"*1\r\n$3\r\nsub\n").await.unwrap_err();
        assert!(matches!(err, RespError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_parse_length_mismatch() {
        let err = parse(b"*1\r\n$4\r\nsub\r\n").await.unwrap_err();
        assert!(matches!(err, RespError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_parse_not_a_number() {
        let err = parse(b"*x1\r\n").await.unwrap_err();
        assert!(matches!(err, RespError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_parse_eof() {
        let err = parse(b"*2\r\n$3\r\nsub\r\n").await.unwrap_err();
        assert!(matches!(err, RespError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mut input = b"*1\r\n$100\r\n".to_vec();
        input.extend(vec![b'a'; 100]);
        input.extend(b"\r\n");
        let mut parser = AsyncCommandParser::with_max_bytes(Cursor::new(input), 32);
        let err = parser.parse_command().await.unwrap_err();
        assert!(matches!(err, RespError::FrameTooLarge(_, 32)));
    }

    #[tokio::test]
    async fn test_unterminated_line_is_bounded() {
        let endless = Cursor::new(b"*".to_vec()).chain(tokio::io::repeat(b'1'));
        let mut parser = AsyncCommandParser::with_max_bytes(endless, 64);
        let err = tokio::time::timeout(Duration::from_secs(1), parser.parse_command())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RespError::FrameTooLarge(65, 64)));
    }

    #[tokio::test]
    async fn test_heartbeat_after_command_is_kept() {
        let input = b"*1\r\n$3\r\nsub\r\nhh".to_vec();
        let mut parser = AsyncCommandParser::new(Cursor::new(input));
        parser.parse_command().await.unwrap();
        assert_eq!(parser.read_byte().await.unwrap(), b'h');
        assert_eq!(parser.read_byte().await.unwrap(), b'h');
        assert!(matches!(
            parser.read_byte().await,
            Err(RespError::UnexpectedEof)
        ));
    }
}
