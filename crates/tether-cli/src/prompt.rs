//! Interactive prompting on the terminal

use std::io::{self, BufRead, Write};
use tether::ValuePrompt;

/// Asks on stdout and reads one line from stdin
///
/// An empty answer accepts the shown default; end of input declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

impl ValuePrompt for StdinPrompt {
    fn provide(&self, question: &str, default: &str) -> Option<String> {
        print!("{question} [{default}]: ");
        io::stdout().flush().ok()?;

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(answer_or_default(&line, default)),
        }
    }
}

fn answer_or_default(line: &str, default: &str) -> String {
    match line.trim() {
        "" => default.to_string(),
        answer => answer.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_answer_takes_default() {
        assert_eq!(answer_or_default("\n", "abc"), "abc");
        assert_eq!(answer_or_default("  bob \n", "abc"), "bob");
    }
}
