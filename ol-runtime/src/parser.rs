use anyhow::{anyhow, Result};
use ol_core::Example;
use ol_utils::{hash_with_seed, namespace_hash};
use std::io::BufRead;
use tracing::warn;

/// Id of the unnamed namespace (`| f1 f2`).
pub const DEFAULT_NAMESPACE: u8 = b' ';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub examples: usize,
    pub skipped: usize,
}

fn parse_number(token: &str, what: &str) -> Result<f32> {
    token
        .parse::<f32>()
        .map_err(|_| anyhow!("Invalid {} '{}'", what, token))
}

fn parse_header(header: &str, ex: &mut Example) -> Result<()> {
    let mut numbers = 0;
    let tokens: Vec<&str> = header.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        if let Some(tag) = token.strip_prefix('\'') {
            ex.tag = Some(tag.to_string());
            continue;
        }
        match numbers {
            0 => match token.parse::<f32>() {
                Ok(label) => ex.label = Some(label),
                // A bare trailing word is a tag on an unlabeled example.
                Err(_) if i + 1 == tokens.len() => {
                    ex.tag = Some(token.to_string());
                    continue;
                }
                Err(_) => return Err(anyhow!("Invalid label '{}'", token)),
            },
            1 => ex.weight = parse_number(token, "importance")?,
            2 => ex.initial = parse_number(token, "initial prediction")?,
            _ => return Err(anyhow!("Unexpected token '{}' before the first '|'", token)),
        }
        numbers += 1;
    }
    if !(ex.weight >= 0.0) {
        return Err(anyhow!("Importance must be non-negative (got {})", ex.weight));
    }
    Ok(())
}

fn parse_namespace(segment: &str, ex: &mut Example) -> Result<()> {
    let mut tokens = segment.split_whitespace();
    let (id, seed, scale) = if segment.starts_with(char::is_whitespace) || segment.is_empty() {
        (DEFAULT_NAMESPACE, 0, 1.0)
    } else {
        let Some(head) = tokens.next() else {
            return Ok(());
        };
        let (name, scale) = match head.split_once(':') {
            Some((name, scale)) => (name, parse_number(scale, "namespace scale")?),
            None => (head, 1.0),
        };
        let Some(&id) = name.as_bytes().first() else {
            return Err(anyhow!("Empty namespace name in '{}'", head));
        };
        (id, namespace_hash(name), scale)
    };

    for token in tokens {
        let (name, value) = match token.split_once(':') {
            Some((name, value)) => (name, parse_number(value, "feature value")?),
            None => (token, 1.0),
        };
        if name.is_empty() {
            return Err(anyhow!("Empty feature name in '{}'", token));
        }
        let value = value * scale;
        if value == 0.0 {
            continue;
        }
        let index = match name.parse::<u64>() {
            Ok(n) => n.wrapping_add(seed),
            Err(_) => hash_with_seed(seed, name),
        };
        ex.push_feature(id, index, value);
    }
    Ok(())
}

/// Parses one line of the text format:
/// `label [importance [initial]] ['tag]|ns[:scale] f[:v] ... |ns2 ...`.
/// Blank lines give `None`.
pub fn parse_line(line: &str, add_constant: bool) -> Result<Option<Example>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let mut segments = line.split('|');
    let mut ex = Example::default();
    parse_header(segments.next().unwrap_or_default(), &mut ex)?;
    for segment in segments {
        parse_namespace(segment, &mut ex)?;
    }
    if add_constant {
        ex.add_constant();
    }
    Ok(Some(ex))
}

/// Parses every line of `reader`, handing examples to `f` until it returns
/// `false`. Malformed lines are skipped with a warning.
pub fn parse_reader<R, F>(reader: R, add_constant: bool, mut f: F) -> Result<ParseStats>
where
    R: BufRead,
    F: FnMut(Example) -> bool,
{
    let mut stats = ParseStats::default();
    for line in reader.lines() {
        let line = line?;
        stats.lines += 1;
        match parse_line(&line, add_constant) {
            Ok(Some(ex)) => {
                stats.examples += 1;
                if !f(ex) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("line {}: {}, skipping", stats.lines, e);
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}
