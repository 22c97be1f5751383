use std::io::{BufRead, Write};

use async_trait::async_trait;
use browser_pilot::DriverError;
use browser_pilot::toolbox::HumanPrompt;

/// Asks on stderr and reads one line from stdin.
pub struct TerminalPrompt;

#[async_trait]
impl HumanPrompt for TerminalPrompt {
    async fn ask(&self, question: &str) -> Result<String, DriverError> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            let mut err = std::io::stderr().lock();
            let _ = write!(err, "\n[Agent] {question}\n> ");
            let _ = err.flush();

            let mut line = String::new();
            let read = std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| DriverError::Other(format!("stdin: {e}")))?;
            if read == 0 {
                return Err(DriverError::Other("stdin closed".into()));
            }
            Ok(line.trim().to_string())
        })
        .await
        .map_err(|e| DriverError::Other(format!("prompt task failed: {e}")))?
    }
}
