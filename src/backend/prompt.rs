use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;

use crate::backend::twitch::{AuthPrompt, Result, TwitchError};

/// Prints the authorization URL and reads back one line
pub struct LinePrompt<R, W> {
    io: Mutex<(R, W)>,
}

pub type TerminalPrompt = LinePrompt<BufReader<Stdin>, Stdout>;

impl TerminalPrompt {
    pub fn stdio() -> Self {
        LinePrompt::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LinePrompt<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
        }
    }
}

#[async_trait]
impl<R, W> AuthPrompt for LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ask(&self, username: &str, authorize_url: &str) -> Result<String> {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;

        let banner = format!(
            "\nAuthorize {} by opening:\n\n  {}\n\nPaste the code or the full redirect URL: ",
            username, authorize_url
        );
        writer.write_all(banner.as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(TwitchError::AuthError(
                "input closed before a code was entered".to_string(),
            ));
        }
        Ok(line.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prints_url_and_reads_line() {
        let input: &[u8] = b"  abc123  \nignored\n";
        let prompt = LinePrompt::new(input, Vec::new());

        let answer = prompt.ask("bot", "https://id.twitch.tv/oauth2/authorize?x=1").await.unwrap();
        assert_eq!(answer, "abc123");

        let output = String::from_utf8(prompt.io.lock().await.1.clone()).unwrap();
        assert!(output.contains("Authorize bot"));
        assert!(output.contains("https://id.twitch.tv/oauth2/authorize?x=1"));
    }

    #[tokio::test]
    async fn test_closed_input_is_an_error() {
        let input: &[u8] = b"";
        let prompt = LinePrompt::new(input, Vec::new());
        assert!(prompt.ask("bot", "https://example").await.is_err());
    }
}
