use std::collections::BTreeSet;

use winnow::combinator::{alt, cut_err, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use trellis_types::{Result, TrellisError};

use crate::ast::Segment;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Slot name: [A-Za-z_][A-Za-z0-9_-]*
fn slot_name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
    )
        .take()
        .parse_next(input)
}

/// `{{` or `}}`, producing a single brace.
fn escaped_brace(input: &mut &str) -> ModalResult<Segment> {
    alt((literal("{{").value("{"), literal("}}").value("}")))
        .map(|s: &str| Segment::Literal(s.to_string()))
        .parse_next(input)
}

fn literal_run(input: &mut &str) -> ModalResult<Segment> {
    take_while(1.., |c: char| c != '{' && c != '}')
        .map(|s: &str| Segment::Literal(s.to_string()))
        .parse_next(input)
}

/// `{name}`; once the opening brace is seen the rest is committed.
fn slot(input: &mut &str) -> ModalResult<Segment> {
    let _ = '{'.parse_next(input)?;
    let name = cut_err(slot_name)
        .context(StrContext::Expected(StrContextValue::Description("slot name")))
        .parse_next(input)?;
    let _ = cut_err('}')
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    Ok(Segment::Slot(name.to_string()))
}

/// A lone `}` is always an error; it is left unconsumed so the reported
/// offset points at it.
fn stray_close(input: &mut &str) -> ModalResult<Segment> {
    if input.starts_with('}') {
        return Err(make_cut_error("'}}' to escape a closing brace"));
    }
    Err(ErrMode::Backtrack(ContextError::new()))
}

fn segment(input: &mut &str) -> ModalResult<Segment> {
    alt((escaped_brace, slot, literal_run, stray_close)).parse_next(input)
}

/// Adjacent literals are merged so `a{{b` yields one `Literal("a{b")`.
fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match (out.last_mut(), seg) {
            (Some(Segment::Literal(prev)), Segment::Literal(text)) => prev.push_str(&text),
            (_, seg) => out.push(seg),
        }
    }
    out
}

/// Strict parse used by [`crate::Template::parse`].
pub(crate) fn parse_segments(source: &str) -> Result<Vec<Segment>> {
    let mut remaining = source;
    let parsed: ModalResult<Vec<Segment>> = repeat(0.., segment).parse_next(&mut remaining);
    let segments = parsed.map_err(|e| {
        let message = match e {
            ErrMode::Backtrack(ctx) | ErrMode::Cut(ctx) => ctx.to_string(),
            ErrMode::Incomplete(_) => "incomplete template".to_string(),
        };
        TrellisError::TemplateSyntax {
            template: source.to_string(),
            offset: source.len() - remaining.len(),
            message,
        }
    })?;
    if !remaining.is_empty() {
        return Err(TrellisError::TemplateSyntax {
            template: source.to_string(),
            offset: source.len() - remaining.len(),
            message: "unexpected input".to_string(),
        });
    }
    Ok(coalesce(segments))
}

/// Collect slot names without validating the rest of the template.
///
/// Malformed braces are skipped one character at a time, so this never fails.
pub fn slots_of(template: &str) -> BTreeSet<String> {
    let mut input = template;
    let mut slots = BTreeSet::new();
    while !input.is_empty() {
        let start = input;
        let lenient = alt((
            escaped_brace,
            ('{', slot_name, '}').map(|(_, name, _): (char, &str, char)| Segment::Slot(name.to_string())),
            literal_run,
        ))
        .parse_next(&mut input);
        match lenient {
            Ok(Segment::Slot(name)) => {
                slots.insert(name);
            }
            Ok(Segment::Literal(_)) => {}
            Err(_) => {
                input = start;
                let skip = input.chars().next().map_or(1, char::len_utf8);
                input = &input[skip..];
            }
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only() {
        let segs = parse_segments("plain/path.fif").unwrap();
        assert_eq!(segs, vec![Segment::Literal("plain/path.fif".into())]);
    }

    #[test]
    fn slots_and_literals_alternate() {
        let segs = parse_segments("{root}/meg/{subject}").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Slot("root".into()),
                Segment::Literal("/meg/".into()),
                Segment::Slot("subject".into()),
            ]
        );
    }

    #[test]
    fn hyphenated_slot_names() {
        let segs = parse_segments("{raw-dir}/x").unwrap();
        assert_eq!(segs[0], Segment::Slot("raw-dir".into()));
    }

    #[test]
    fn escapes_merge_into_literals() {
        let segs = parse_segments("a{{b}}c").unwrap();
        assert_eq!(segs, vec![Segment::Literal("a{b}c".into())]);
    }

    #[test]
    fn empty_template() {
        assert!(parse_segments("").unwrap().is_empty());
    }

    #[test]
    fn unclosed_slot_reports_offset() {
        let err = parse_segments("ab{subject").unwrap_err();
        match err {
            TrellisError::TemplateSyntax { offset, .. } => assert_eq!(offset, 10),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_slot_is_rejected() {
        assert!(matches!(
            parse_segments("x{}y"),
            Err(TrellisError::TemplateSyntax { offset: 2, .. })
        ));
    }

    #[test]
    fn stray_close_brace_is_rejected() {
        assert!(matches!(
            parse_segments("ab}c"),
            Err(TrellisError::TemplateSyntax { offset: 2, .. })
        ));
    }

    #[test]
    fn slots_of_is_lenient() {
        let slots = slots_of("{subject}/{ bad }/{session}}/{{escaped}}/{");
        let names: Vec<&str> = slots.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["session", "subject"]);
    }

    #[test]
    fn slots_of_deduplicates() {
        assert_eq!(slots_of("{subject}/{subject}_{session}").len(), 2);
    }
}
