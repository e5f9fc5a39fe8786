//! Interviewer trait and built-in implementations for confirming cache
//! invalidation.

use std::io::{BufRead, Write};
use std::cell::RefCell;

use trellis_types::Result;

#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    pub choices: Vec<String>,
    pub default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub choice: String,
    pub custom_text: Option<String>,
}

impl Answer {
    pub fn choice(choice: &str) -> Self {
        Self {
            choice: choice.to_string(),
            custom_text: None,
        }
    }
}

pub trait Interviewer {
    fn ask(&self, question: &Question) -> Result<Answer>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Answers every question with its default, else its first choice.
pub struct AutoApproveInterviewer;

impl Interviewer for AutoApproveInterviewer {
    fn ask(&self, question: &Question) -> Result<Answer> {
        let choice = question
            .default
            .clone()
            .or_else(|| question.choices.first().cloned())
            .unwrap_or_default();
        Ok(Answer {
            choice,
            custom_text: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Prompts on stdout and reads one line from stdin. Accepts a choice number
/// or the choice itself.
pub struct ConsoleInterviewer;

impl Interviewer for ConsoleInterviewer {
    fn ask(&self, question: &Question) -> Result<Answer> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "\n{}", question.prompt)?;
        for (i, choice) in question.choices.iter().enumerate() {
            let marker = if question.default.as_deref() == Some(choice.as_str()) {
                " (default)"
            } else {
                ""
            };
            writeln!(out, "  [{}] {}{}", i + 1, choice, marker)?;
        }
        out.flush()?;

        let mut input = String::new();
        std::io::stdin().lock().read_line(&mut input)?;
        let trimmed = input.trim();
        if trimmed.is_empty() {
            if let Some(default) = &question.default {
                return Ok(Answer::choice(default));
            }
        }
        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.choices.len() {
                return Ok(Answer::choice(&question.choices[idx - 1]));
            }
        }
        Ok(Answer {
            choice: trimmed.to_lowercase(),
            custom_text: Some(trimmed.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

/// Plays back preset answers in order and records every question asked.
/// Falls back to the first choice once the answers run out.
pub struct RecordingInterviewer {
    answers: RefCell<Vec<Answer>>,
    questions: RefCell<Vec<Question>>,
}

impl RecordingInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: RefCell::new(reversed),
            questions: RefCell::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<Question> {
        self.questions.borrow().clone()
    }
}

impl Interviewer for RecordingInterviewer {
    fn ask(&self, question: &Question) -> Result<Answer> {
        self.questions.borrow_mut().push(question.clone());
        let answer = self.answers.borrow_mut().pop().unwrap_or_else(|| Answer {
            choice: question.choices.first().cloned().unwrap_or_default(),
            custom_text: None,
        });
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn question(default: Option<&str>) -> Question {
        Question {
            prompt: "3 cached files are outdated".into(),
            choices: vec!["abort".into(), "delete".into(), "ignore".into()],
            default: default.map(Into::into),
        }
    }

    #[test]
    fn auto_approve_picks_first_choice() {
        let answer = AutoApproveInterviewer.ask(&question(None)).unwrap();
        assert_eq!(answer.choice, "abort");
        assert!(answer.custom_text.is_none());
    }

    #[test]
    fn auto_approve_picks_default_when_set() {
        let answer = AutoApproveInterviewer.ask(&question(Some("delete"))).unwrap();
        assert_eq!(answer.choice, "delete");
    }

    #[test]
    fn recording_plays_back_answers() {
        let interviewer = RecordingInterviewer::new(vec![
            Answer::choice("ignore"),
            Answer {
                choice: "delete".into(),
                custom_text: Some("Delete".into()),
            },
        ]);

        assert_eq!(interviewer.ask(&question(None)).unwrap().choice, "ignore");
        let second = interviewer.ask(&question(None)).unwrap();
        assert_eq!(second.choice, "delete");
        assert_eq!(second.custom_text.as_deref(), Some("Delete"));
        // exhausted: first choice
        assert_eq!(interviewer.ask(&question(None)).unwrap().choice, "abort");

        assert_eq!(interviewer.questions().len(), 3);
    }
}
