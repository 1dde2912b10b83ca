//! Simulated container programs
//!
//! The in-process engine does not execute anything. A container's command is
//! read as a tiny shell script instead: `echo` writes a line of output,
//! `sleep N` waits, `true`/`false` set the status, `exit N` ends the program.
//! Any other command is treated as a long-running server that only stops when
//! the container is stopped or killed. Steps are separated by `;` or `&&`.

use std::time::Duration;

/// One step of a program
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Echo(String),
    Sleep(Duration),
    Status(i64),
    Exit(i64),
    Serve,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    steps: Vec<Step>,
}

impl Program {
    /// Build a program from a container command. `sh -c SCRIPT` runs SCRIPT.
    pub fn parse(command: &[String]) -> Self {
        let script = match command {
            [] => return Self { steps: vec![Step::Serve] },
            [shell, flag, rest @ ..] if is_shell(shell) && flag == "-c" => rest.join(" "),
            _ => command.join(" "),
        };
        Self::parse_script(&script)
    }

    /// Parse a healthcheck test (`CMD ...`, `CMD-SHELL ...` or bare command)
    pub fn parse_test(test: &[String]) -> Self {
        match test.split_first() {
            Some((kind, rest)) if kind == "CMD" || kind == "CMD-SHELL" => Self::parse(rest),
            _ => Self::parse(test),
        }
    }

    pub fn parse_script(script: &str) -> Self {
        let steps = script
            .split(';')
            .flat_map(|part| part.split("&&"))
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(parse_step)
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Exit status when run to completion without waiting, as a healthcheck.
    /// A server counts as success.
    pub fn check_status(&self) -> i64 {
        let mut status = 0;
        for step in &self.steps {
            match step {
                Step::Status(code) => status = *code,
                Step::Exit(code) => return *code,
                Step::Echo(_) | Step::Sleep(_) | Step::Serve => status = 0,
            }
        }
        status
    }
}

fn is_shell(program: &str) -> bool {
    matches!(program, "sh" | "/bin/sh" | "bash" | "/bin/bash")
}

fn parse_step(command: &str) -> Step {
    let mut words = command.split_whitespace();
    let Some(program) = words.next() else {
        return Step::Status(0);
    };
    let args: Vec<&str> = words.collect();

    match program {
        "echo" => Step::Echo(args.iter().map(|a| unquote(a)).collect::<Vec<_>>().join(" ")),
        "true" | ":" => Step::Status(0),
        "false" => Step::Status(1),
        "exit" => Step::Exit(args.first().and_then(|a| a.parse().ok()).unwrap_or(0)),
        "sleep" => args
            .first()
            .and_then(|a| a.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Step::Sleep(Duration::from_secs_f64(secs)))
            .unwrap_or(Step::Status(1)),
        _ => Step::Serve,
    }
}

fn unquote(word: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = word
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    word.trim_matches(|c| c == '"' || c == '\'')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_command_serves() {
        assert_eq!(Program::parse(&[]).steps(), &[Step::Serve]);
    }

    #[test]
    fn test_shell_script() {
        let program = Program::parse(&cmd(&["sh", "-c", "echo 'hello world'; sleep 0.5 && exit 3"]));
        assert_eq!(
            program.steps(),
            &[
                Step::Echo("hello world".to_string()),
                Step::Sleep(Duration::from_millis(500)),
                Step::Exit(3),
            ]
        );
    }

    #[test]
    fn test_plain_echo() {
        let program = Program::parse(&cmd(&["echo", "hello"]));
        assert_eq!(program.steps(), &[Step::Echo("hello".to_string())]);
    }

    #[test]
    fn test_unknown_program_serves() {
        let program = Program::parse(&cmd(&["nginx", "-g", "daemon off;"]));
        assert_eq!(program.steps()[0], Step::Serve);
    }

    #[test]
    fn test_check_status() {
        assert_eq!(Program::parse_test(&cmd(&["CMD", "true"])).check_status(), 0);
        assert_eq!(Program::parse_test(&cmd(&["CMD-SHELL", "false"])).check_status(), 1);
        assert_eq!(Program::parse_test(&cmd(&["exit", "4"])).check_status(), 4);
        assert_eq!(Program::parse_test(&cmd(&["CMD", "pg_isready"])).check_status(), 0);
    }
}
