//! Utilities (platform commands, interactive prompts).

use std::io::{self, BufRead, Write};

pub mod command;

pub use command::{is_root, open_url};

/// Interpret a yes/no answer. `None` means the answer was not understood.
pub fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Ask until the user answers y/yes/n/no. End of input counts as "no".
pub fn query_yes_no<R: BufRead, W: Write>(prompt: &str, input: &mut R, output: &mut W) -> io::Result<bool> {
    let mut prompt = prompt.to_string();
    loop {
        write!(output, "{prompt} [y/n] ")?;
        output.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        if let Some(answer) = parse_yes_no(&line) {
            return Ok(answer);
        }
        prompt = "Please answer in y/yes/n/no.".to_string();
    }
}
