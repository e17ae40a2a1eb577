//! Containerfile-style recipe parser.
//!
//! Lines ending in `\` continue on the next line, `#` starts a comment line,
//! keywords are case-insensitive.

use super::{CommandForm, Directive, Instruction, PackageList, Port, Protocol, Recipe};
use crate::reference::ImageReference;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe contains no directives")]
    Empty,
    #[error("line {line}: first directive must be FROM, found {keyword}")]
    MissingFrom { line: usize, keyword: String },
    #[error("line {line}: only one FROM per recipe is supported")]
    DuplicateFrom { line: usize },
    #[error("line {line}: unknown directive '{keyword}'")]
    UnknownDirective { line: usize, keyword: String },
    #[error("line {line}: {keyword}: {message}")]
    Invalid {
        line: usize,
        keyword: String,
        message: String,
    },
}

pub(super) fn parse_recipe(text: &str) -> Result<Recipe, RecipeError> {
    let mut instructions = Vec::new();
    for (line, logical) in logical_lines(text) {
        let (keyword, rest) = match logical.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (logical.as_str(), ""),
        };
        let keyword = keyword.to_ascii_uppercase();
        let directive = parse_directive(line, &keyword, rest)?;

        match (&directive, instructions.is_empty()) {
            (Directive::From(_), false) => return Err(RecipeError::DuplicateFrom { line }),
            (Directive::From(_), true) => {}
            (other, true) => {
                return Err(RecipeError::MissingFrom {
                    line,
                    keyword: other.keyword().to_string(),
                })
            }
            _ => {}
        }

        instructions.push(Instruction { line, directive });
    }

    if instructions.is_empty() {
        return Err(RecipeError::Empty);
    }
    Ok(Recipe { instructions })
}

/// Join continuation lines; yields `(first line number, text)`.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (content, continues) = match trimmed.strip_suffix('\\') {
            Some(content) => (content.trim_end(), true),
            None => (trimmed, false),
        };
        match pending.as_mut() {
            Some((_, buf)) => {
                if !content.is_empty() {
                    buf.push(' ');
                    buf.push_str(content);
                }
            }
            None => pending = Some((idx + 1, content.to_string())),
        }
        if !continues {
            out.extend(pending.take());
        }
    }
    out.extend(pending);
    out
}

fn parse_directive(line: usize, keyword: &str, rest: &str) -> Result<Directive, RecipeError> {
    let invalid = |message: String| RecipeError::Invalid {
        line,
        keyword: keyword.to_string(),
        message,
    };
    if rest.is_empty() {
        return Err(invalid("missing arguments".into()));
    }

    match keyword {
        "FROM" => {
            let words = split_words(rest).map_err(invalid)?;
            match words.as_slice() {
                [reference] => reference
                    .parse::<ImageReference>()
                    .map(Directive::From)
                    .map_err(|e| invalid(e.to_string())),
                [_, as_kw, _] if as_kw.eq_ignore_ascii_case("as") => {
                    Err(invalid("multi-stage builds are not supported".into()))
                }
                _ => Err(invalid("expected exactly one image reference".into())),
            }
        }
        "ENV" => parse_env(rest).map(Directive::Env).map_err(invalid),
        "LABEL" => {
            let words = split_words(rest).map_err(invalid)?;
            let pairs = key_value_pairs(&words).map_err(invalid)?;
            Ok(Directive::Label(pairs))
        }
        "WORKDIR" => {
            let words = split_words(rest).map_err(invalid)?;
            match words.as_slice() {
                [path] if !path.is_empty() => Ok(Directive::Workdir(path.clone())),
                _ => Err(invalid("expected exactly one path".into())),
            }
        }
        "COPY" => {
            let words = if rest.starts_with('[') {
                serde_json::from_str::<Vec<String>>(rest)
                    .map_err(|e| invalid(format!("invalid JSON form: {e}")))?
            } else {
                split_words(rest).map_err(invalid)?
            };
            if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
                return Err(invalid(format!("unsupported flag '{flag}'")));
            }
            match words.split_last() {
                Some((dest, sources)) if !sources.is_empty() => Ok(Directive::Copy {
                    sources: sources.to_vec(),
                    dest: dest.clone(),
                }),
                _ => Err(invalid(
                    "expected at least one source and a destination".into(),
                )),
            }
        }
        "RUN" => Ok(Directive::Run(command_form(rest))),
        "CMD" => Ok(Directive::Cmd(command_form(rest))),
        "INSTALL" => {
            let words = split_words(rest).map_err(invalid)?;
            match words.split_first() {
                Some((list, packages)) if list.eq_ignore_ascii_case("os") => {
                    if packages.is_empty() {
                        return Err(invalid("INSTALL os needs at least one package".into()));
                    }
                    Ok(Directive::Install(PackageList::Os(packages.to_vec())))
                }
                Some((list, args)) if list.eq_ignore_ascii_case("pip") => match args {
                    [manifest] => Ok(Directive::Install(PackageList::Pip {
                        manifest: manifest.clone(),
                    })),
                    _ => Err(invalid("INSTALL pip takes exactly one manifest path".into())),
                },
                _ => Err(invalid("expected 'os <packages…>' or 'pip <manifest>'".into())),
            }
        }
        "EXPOSE" => {
            let words = split_words(rest).map_err(invalid)?;
            let ports = words
                .iter()
                .map(|w| parse_port(w))
                .collect::<Result<Vec<_>, _>>()
                .map_err(invalid)?;
            Ok(Directive::Expose(ports))
        }
        other => Err(RecipeError::UnknownDirective {
            line,
            keyword: other.to_string(),
        }),
    }
}

fn command_form(rest: &str) -> CommandForm {
    if rest.starts_with('[') {
        if let Ok(argv) = serde_json::from_str::<Vec<String>>(rest) {
            if !argv.is_empty() {
                return CommandForm::Exec(argv);
            }
        }
    }
    CommandForm::Shell(rest.to_string())
}

fn parse_env(rest: &str) -> Result<Vec<(String, String)>, String> {
    let words = split_words(rest)?;
    let first = words.first().ok_or("missing arguments")?;
    if !first.contains('=') {
        // Legacy `ENV KEY value with spaces` form. The key is taken from the
        // raw text, so a quoted key fails validation.
        let raw = rest.trim_start();
        let (key, value) = raw.split_once(char::is_whitespace).unwrap_or((raw, ""));
        validate_env_key(key)?;
        return Ok(vec![(key.to_string(), value.trim().to_string())]);
    }
    let pairs = key_value_pairs(&words)?;
    for (key, _) in &pairs {
        validate_env_key(key)?;
    }
    Ok(pairs)
}

fn key_value_pairs(words: &[String]) -> Result<Vec<(String, String)>, String> {
    words
        .iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("expected key=value, got '{word}'")),
        })
        .collect()
}

fn validate_env_key(key: &str) -> Result<(), String> {
    let mut chars = key.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid environment variable name '{key}'"));
    }
    Ok(())
}

fn parse_port(word: &str) -> Result<Port, String> {
    let (number, protocol) = match word.split_once('/') {
        Some((number, proto)) => {
            let protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => return Err(format!("unsupported protocol '{other}'")),
            };
            (number, protocol)
        }
        None => (word, Protocol::Tcp),
    };
    let number: u16 = number
        .parse()
        .map_err(|_| format!("invalid port '{word}'"))?;
    if number == 0 {
        return Err("port 0 is not a valid listening port".into());
    }
    Ok(Port { number, protocol })
}

/// Split on whitespace honouring single quotes, double quotes and `\` escapes.
pub(crate) fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\\' => {
                let next = chars.next().ok_or("trailing backslash")?;
                current.push(next);
                in_word = true;
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".into()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            other => {
                current.push(other);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Expand `$VAR`, `${VAR}` and `${VAR:-default}` against `env`. Unset
/// variables expand to the empty string; `\$` is a literal dollar.
pub fn expand_vars(input: &str, env: &[(String, String)]) -> String {
    let lookup = |name: &str| {
        env.iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                out.push('$');
                chars.next();
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == '}' {
                        closed = true;
                        break;
                    }
                    body.push(ch);
                }
                if !closed {
                    out.push_str("${");
                    out.push_str(&body);
                    continue;
                }
                match body.split_once(":-") {
                    Some((name, default)) => match lookup(name) {
                        Some(value) if !value.is_empty() => out.push_str(value),
                        _ => out.push_str(default),
                    },
                    None => out.push_str(lookup(&body).unwrap_or("")),
                }
            }
            '$' if chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_') =>
            {
                let mut name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(lookup(&name).unwrap_or(""));
            }
            other => out.push(other),
        }
    }
    out
}
