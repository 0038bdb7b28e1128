//! Shell-string intent: a best-effort word split used for policy,
//! auditing, and for routing simple strings through the argv path.

use serde_json::Value;

/// What a shell string appears to do. `is_complex` flags operators,
/// redirections, command substitution, and parse failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub argv: Vec<String>,
    pub is_complex: bool,
    pub reason: Option<String>,
}

impl Intent {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "argv": self.argv,
            "is_complex": self.is_complex,
            "reason": self.reason,
        })
    }
}

/// Split a shell command into words; mark it complex on operators,
/// redirections, command substitution, or parse failure.
pub fn parse_intent(command: &str) -> Intent {
    let mut argv = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut complex_reason: Option<&str> = None;

    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => word.push(inner),
                        None => {
                            return Intent {
                                argv,
                                is_complex: true,
                                reason: Some("unterminated single quote".into()),
                            }
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        Some('`') => {
                            complex_reason.get_or_insert("command substitution");
                            word.push('`');
                        }
                        Some('$') if chars.peek() == Some(&'(') => {
                            complex_reason.get_or_insert("command substitution");
                            word.push('$');
                        }
                        Some(inner) => word.push(inner),
                        None => {
                            return Intent {
                                argv,
                                is_complex: true,
                                reason: Some("unterminated double quote".into()),
                            }
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut word));
                    in_word = false;
                }
                if c == '\n' {
                    complex_reason.get_or_insert("multiple commands");
                }
            }
            '|' | '&' | ';' => {
                complex_reason.get_or_insert("shell operator");
                if in_word {
                    argv.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '<' | '>' => {
                complex_reason.get_or_insert("redirection");
                if in_word {
                    argv.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '`' => {
                complex_reason.get_or_insert("command substitution");
                in_word = true;
                word.push('`');
            }
            '$' if chars.peek() == Some(&'(') => {
                complex_reason.get_or_insert("command substitution");
                in_word = true;
                word.push('$');
            }
            '(' | ')' => {
                complex_reason.get_or_insert("subshell");
                in_word = true;
                word.push(c);
            }
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    if in_word {
        argv.push(word);
    }

    Intent {
        argv,
        is_complex: complex_reason.is_some(),
        reason: complex_reason.map(str::to_string),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_words() {
        let intent = parse_intent("pytest -q tests/unit");
        assert_eq!(intent.argv, vec!["pytest", "-q", "tests/unit"]);
        assert!(!intent.is_complex);
        assert!(intent.reason.is_none());
    }

    #[test]
    fn quotes() {
        let intent = parse_intent(r#"echo "hello world" 'single quoted'"#);
        assert_eq!(intent.argv, vec!["echo", "hello world", "single quoted"]);
        assert!(!intent.is_complex);
    }

    #[test]
    fn pipe_is_complex() {
        let intent = parse_intent("cat log | grep error");
        assert!(intent.is_complex);
        assert_eq!(intent.reason.as_deref(), Some("shell operator"));
        assert_eq!(intent.argv[0], "cat");
    }

    #[test]
    fn redirection_is_complex() {
        assert!(parse_intent("echo hi > out.txt").is_complex);
        assert!(parse_intent("sort < data.txt").is_complex);
    }

    #[test]
    fn command_substitution_is_complex() {
        assert!(parse_intent("echo $(whoami)").is_complex);
        assert!(parse_intent("echo `whoami`").is_complex);
        assert!(parse_intent(r#"echo "$(whoami)""#).is_complex);
    }

    #[test]
    fn chained_commands_are_complex() {
        assert!(parse_intent("make && make test").is_complex);
        assert!(parse_intent("a; b").is_complex);
        assert!(parse_intent("task &").is_complex);
        assert!(parse_intent("one\ntwo").is_complex);
    }

    #[test]
    fn parse_failure_is_complex() {
        let intent = parse_intent("echo 'unterminated");
        assert!(intent.is_complex);
        assert_eq!(intent.reason.as_deref(), Some("unterminated single quote"));
    }

    #[test]
    fn escaped_specials_are_simple() {
        let intent = parse_intent(r#"grep \| notes.txt"#);
        assert_eq!(intent.argv, vec!["grep", "|", "notes.txt"]);
        assert!(!intent.is_complex);
    }

    #[test]
    fn dollar_variable_is_not_substitution() {
        let intent = parse_intent("echo $HOME");
        assert_eq!(intent.argv, vec!["echo", "$HOME"]);
        assert!(!intent.is_complex);
    }

    #[test]
    fn empty_command() {
        let intent = parse_intent("   ");
        assert!(intent.argv.is_empty());
        assert!(!intent.is_complex);
    }
}
