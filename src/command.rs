//! The text commands of a job file.
//!
//! A job file holds one command per line:
//!
//! ```text
//! WRITE [(key,value)(key2,value2)]
//! READ [key,key2]
//! DELETE [key,key2]
//! SHOW
//! WAIT <delay_ms>
//! BACKUP
//! HELP
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. A line that does not parse becomes
//! [`Command::Invalid`]; it is reported and the rest of the job still runs.
use std::io::{self, BufRead};

/// maximum number of pairs or keys in a single batch command
pub const MAX_BATCH_SIZE: usize = 256;

/// usage text written to the output file by `HELP`
pub const HELP_TEXT: &str = "Available commands:
  WRITE [(key,value)(key2,value2),...]
  READ [key,key2,...]
  DELETE [key,key2,...]
  SHOW
  WAIT <delay_ms>
  BACKUP
  HELP
";

/// One parsed line of a job file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// sets every pair
    Write(Vec<(String, String)>),
    /// reads every key
    Read(Vec<String>),
    /// deletes every key
    Delete(Vec<String>),
    /// dumps the whole store
    Show,
    /// sleeps for the given number of milliseconds
    Wait(u64),
    /// snapshots the store into a backup file
    Backup,
    /// prints the usage text
    Help,
    /// a blank line or a comment
    Empty,
    /// a line that could not be parsed, with the reason
    Invalid(String),
}

impl Command {
    /// Parses one line. Keys and values longer than `max_len` make the line invalid.
    pub fn parse(line: &str, max_len: usize) -> Command {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Command::Empty;
        }
        let (word, args) = match line.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args.trim()),
            None => (line, ""),
        };

        let parsed = match word {
            "WRITE" => parse_pairs(args, max_len).map(Command::Write),
            "READ" => parse_keys(args, max_len).map(Command::Read),
            "DELETE" => parse_keys(args, max_len).map(Command::Delete),
            "SHOW" => no_args(args, Command::Show),
            "BACKUP" => no_args(args, Command::Backup),
            "HELP" => no_args(args, Command::Help),
            "WAIT" => args
                .parse::<u64>()
                .map(Command::Wait)
                .map_err(|_| format!("WAIT expects a delay in milliseconds, got {:?}", args)),
            other => Err(format!("unknown command {:?}", other)),
        };
        parsed.unwrap_or_else(Command::Invalid)
    }
}

fn no_args(args: &str, command: Command) -> Result<Command, String> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(format!("unexpected arguments {:?}", args))
    }
}

fn brackets(args: &str) -> Result<&str, String> {
    args.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| format!("expected a bracketed list, got {:?}", args))
}

fn token(s: &str, max_len: usize) -> Result<String, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty key or value".to_string());
    }
    if s.len() > max_len {
        return Err(format!("{:?} is longer than {} characters", s, max_len));
    }
    Ok(s.to_string())
}

fn check_batch<T>(items: Vec<T>) -> Result<Vec<T>, String> {
    match items.len() {
        0 => Err("empty batch".to_string()),
        n if n > MAX_BATCH_SIZE => Err(format!("batch of {} exceeds {}", n, MAX_BATCH_SIZE)),
        _ => Ok(items),
    }
}

// [(k,v)(k2,v2)], pairs may be separated by commas or whitespace
fn parse_pairs(args: &str, max_len: usize) -> Result<Vec<(String, String)>, String> {
    let mut rest = brackets(args)?;
    let mut pairs = Vec::new();
    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }
        let body = rest
            .strip_prefix('(')
            .ok_or_else(|| format!("expected '(' at {:?}", rest))?;
        let end = body
            .find(')')
            .ok_or_else(|| format!("unterminated pair at {:?}", rest))?;
        let (key, value) = body[..end]
            .split_once(',')
            .ok_or_else(|| format!("pair {:?} has no value", &body[..end]))?;
        pairs.push((token(key, max_len)?, token(value, max_len)?));
        rest = &body[end + 1..];
    }
    check_batch(pairs)
}

// [k,k2]
fn parse_keys(args: &str, max_len: usize) -> Result<Vec<String>, String> {
    let inner = brackets(args)?;
    let keys = inner
        .split(',')
        .map(|key| token(key, max_len))
        .collect::<Result<Vec<_>, _>>()?;
    check_batch(keys)
}

/// Iterates over the commands of a job file, one per line
#[derive(Debug)]
pub struct CommandReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
    line_no: usize,
}

impl<R: BufRead> CommandReader<R> {
    /// reads commands from `reader`, rejecting keys and values longer than `max_len`
    pub fn new(reader: R, max_len: usize) -> Self {
        CommandReader {
            reader,
            buf: Vec::new(),
            max_len,
            line_no: 0,
        }
    }

    /// the number of the last line returned, starting at 1
    pub fn line_no(&self) -> usize {
        self.line_no
    }
}

impl<R: BufRead> Iterator for CommandReader<R> {
    type Item = io::Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        self.line_no += 1;

        let mut line = self.buf.as_slice();
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest.strip_suffix(b"\r").unwrap_or(rest);
        }
        // a line that is not UTF-8 is reported like any other unparsable line
        let command = match std::str::from_utf8(line) {
            Ok(line) => Command::parse(line, self.max_len),
            Err(e) => Command::Invalid(format!("not valid UTF-8: {}", e)),
        };
        Some(Ok(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(line: &str) -> Command {
        Command::parse(line, 10)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_batches() {
        assert_eq!(
            parse("WRITE [(a,1)(b,2)]"),
            Command::Write(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ])
        );
        assert_eq!(
            parse("WRITE [(a, 1), (b,2)]"),
            Command::Write(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ])
        );
        assert_eq!(parse("READ [a,b]"), Command::Read(strings(&["a", "b"])));
        assert_eq!(parse("  DELETE [a, c]  "), Command::Delete(strings(&["a", "c"])));
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse("SHOW"), Command::Show);
        assert_eq!(parse("BACKUP"), Command::Backup);
        assert_eq!(parse("HELP"), Command::Help);
        assert_eq!(parse("WAIT 250"), Command::Wait(250));
        assert_eq!(parse(""), Command::Empty);
        assert_eq!(parse("# a comment"), Command::Empty);
    }

    #[test]
    fn rejects_bad_lines() {
        for line in [
            "WRITE []",
            "WRITE [(a)]",
            "WRITE [(a,1)",
            "READ a,b",
            "READ [a,,b]",
            "WAIT soon",
            "SHOW everything",
            "write [(a,1)]",
            "READ [this-key-is-too-long]",
        ] {
            assert!(
                matches!(parse(line), Command::Invalid(_)),
                "{:?} should be invalid",
                line
            );
        }
    }

    #[test]
    fn batches_are_bounded() {
        let keys: Vec<String> = (0..=MAX_BATCH_SIZE).map(|i| format!("k{}", i)).collect();
        let line = format!("READ [{}]", keys.join(","));
        assert!(matches!(parse(&line), Command::Invalid(_)));
    }

    #[test]
    fn reader_yields_one_command_per_line() {
        let job = "WRITE [(a,1)]\n\n# note\nREAD [a]\nbogus\n";
        let mut reader = CommandReader::new(Cursor::new(job), 10);
        let commands: Vec<Command> = reader.by_ref().map(|c| c.unwrap()).collect();
        assert_eq!(commands.len(), 5);
        assert_eq!(commands[1], Command::Empty);
        assert_eq!(commands[3], Command::Read(strings(&["a"])));
        assert!(matches!(commands[4], Command::Invalid(_)));
        assert_eq!(reader.line_no(), 5);
    }

    #[test]
    fn lines_that_are_not_utf8_are_invalid() {
        let mut job = b"WRITE [(a,1)]\r\n".to_vec();
        job.extend_from_slice(b"READ [\xff\xfe]\n");
        job.extend_from_slice(b"READ [a]");
        let commands: Vec<Command> = CommandReader::new(Cursor::new(job), 10)
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            Command::Write(vec![("a".to_string(), "1".to_string())])
        );
        assert!(matches!(commands[1], Command::Invalid(_)));
        assert_eq!(commands[2], Command::Read(strings(&["a"])));
    }
}
