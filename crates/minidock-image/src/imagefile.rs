//! Imagefile parsing.
//!
//! The build grammar:
//!
//! ```text
//! FROM <path>
//! ENV K=V            (repeatable)
//! RUN <shell cmd>
//! COPY <src> <dst>
//! WORKDIR <path>
//! CMD ["argv", ...]
//! ENTRYPOINT ["argv", ...]
//! ```
//!
//! `#` starts a comment line; a trailing `\` continues the line. CMD and
//! ENTRYPOINT accept either the JSON-array exec form or a shell string.

use minidock_common::{MinidockError, MinidockResult};

/// One parsed build instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Base rootfs path.
    From(String),
    /// Environment variable.
    Env {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Shell command run in the image.
    Run(String),
    /// Copy from the build context into the image.
    Copy {
        /// Source, relative to the build context.
        src: String,
        /// Destination inside the image.
        dst: String,
    },
    /// Default working directory.
    Workdir(String),
    /// Default command.
    Cmd(Vec<String>),
    /// Entrypoint.
    Entrypoint(Vec<String>),
}

/// Parse an Imagefile's content into instructions.
pub fn parse_imagefile(content: &str) -> MinidockResult<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut pending = String::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(continued) = line.strip_suffix('\\') {
            pending.push_str(continued);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);

        let full = std::mem::take(&mut pending);
        instructions.push(parse_line(&full)?);
    }

    if !pending.is_empty() {
        return Err(MinidockError::ConfigInvalid {
            message: "Imagefile ends with a line continuation".to_string(),
        });
    }
    Ok(instructions)
}

fn parse_line(line: &str) -> MinidockResult<Instruction> {
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (line, ""),
    };

    let invalid = |message: String| MinidockError::ConfigInvalid { message };

    match keyword.to_ascii_uppercase().as_str() {
        "FROM" => {
            if rest.is_empty() {
                return Err(invalid("FROM requires a path".to_string()));
            }
            Ok(Instruction::From(rest.to_string()))
        }
        "ENV" => {
            let (key, value) = rest
                .split_once('=')
                .ok_or_else(|| invalid(format!("ENV requires K=V, got: {rest}")))?;
            Ok(Instruction::Env {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            })
        }
        "RUN" => {
            if rest.is_empty() {
                return Err(invalid("RUN requires a command".to_string()));
            }
            Ok(Instruction::Run(rest.to_string()))
        }
        "COPY" => {
            let mut parts = rest.split_whitespace();
            let src = parts.next();
            let dst = parts.next();
            match (src, dst, parts.next()) {
                (Some(src), Some(dst), None) => Ok(Instruction::Copy {
                    src: src.to_string(),
                    dst: dst.to_string(),
                }),
                _ => Err(invalid(format!("COPY requires <src> <dst>, got: {rest}"))),
            }
        }
        "WORKDIR" => {
            if rest.is_empty() {
                return Err(invalid("WORKDIR requires a path".to_string()));
            }
            Ok(Instruction::Workdir(rest.to_string()))
        }
        "CMD" => Ok(Instruction::Cmd(parse_exec_form(rest)?)),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint(parse_exec_form(rest)?)),
        other => Err(invalid(format!("unknown instruction: {other}"))),
    }
}

/// Parse `["a", "b"]` exec form, falling back to `sh -c` shell form.
fn parse_exec_form(rest: &str) -> MinidockResult<Vec<String>> {
    if rest.starts_with('[') {
        serde_json::from_str::<Vec<String>>(rest).map_err(|e| MinidockError::ConfigInvalid {
            message: format!("invalid exec-form array: {e}"),
        })
    } else if rest.is_empty() {
        Err(MinidockError::ConfigInvalid {
            message: "CMD/ENTRYPOINT requires arguments".to_string(),
        })
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_instructions() {
        let content = r#"
# build the app image
FROM ./base-rootfs
ENV PATH=/usr/bin:/bin
ENV APP_MODE=production
RUN mkdir -p /app
COPY app.bin /app/app
WORKDIR /app
CMD ["/app/app", "--serve"]
"#;
        let instructions = parse_imagefile(content).unwrap();
        assert_eq!(instructions.len(), 7);
        assert_eq!(instructions[0], Instruction::From("./base-rootfs".into()));
        assert_eq!(
            instructions[2],
            Instruction::Env {
                key: "APP_MODE".into(),
                value: "production".into()
            }
        );
        assert_eq!(
            instructions[6],
            Instruction::Cmd(vec!["/app/app".into(), "--serve".into()])
        );
    }

    #[test]
    fn line_continuation() {
        let content = "RUN apk add --no-cache \\\n    curl wget\n";
        let instructions = parse_imagefile(content).unwrap();
        assert_eq!(
            instructions[0],
            Instruction::Run("apk add --no-cache curl wget".into())
        );
    }

    #[test]
    fn cmd_shell_form() {
        let instructions = parse_imagefile("CMD echo hello\n").unwrap();
        assert_eq!(
            instructions[0],
            Instruction::Cmd(vec!["/bin/sh".into(), "-c".into(), "echo hello".into()])
        );
    }

    #[test]
    fn rejects_unknown_instruction() {
        assert!(parse_imagefile("VOLUME /data\n").is_err());
    }

    #[test]
    fn rejects_malformed_env() {
        assert!(parse_imagefile("ENV NOEQUALS\n").is_err());
    }

    #[test]
    fn rejects_trailing_continuation() {
        assert!(parse_imagefile("RUN echo hi \\\n").is_err());
    }
}
