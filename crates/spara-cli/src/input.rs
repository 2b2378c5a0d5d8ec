use std::{
    fs::File,
    io::{self, BufRead, BufReader},
};

use anyhow::Context;

use crate::config::RunConfig;

/// Reads the work items named by `config`: the input file, or stdin.
pub fn read_items(config: &RunConfig) -> anyhow::Result<Vec<String>> {
    match &config.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open input {}", path.display()))?;
            parse_items(BufReader::new(file), config.skip_empty)
        }
        None => parse_items(io::stdin().lock(), config.skip_empty),
    }
}

/// One item per line, without the line terminator (`\n` or `\r\n`).
pub fn parse_items<R: BufRead>(reader: R, skip_empty: bool) -> anyhow::Result<Vec<String>> {
    let mut items = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read input line {}", line_no + 1))?;
        if skip_empty && line.trim().is_empty() {
            continue;
        }
        items.push(line);
    }
    Ok(items)
}
