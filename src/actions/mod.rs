//! Action parsing
//!
//! Strict allow-list parser: `<verb> ["<target>"] [parameters...]`.
//! Anything outside the supported verbs is refused, never interpreted.

use crate::error::OrchestrationError;
use crate::models::{ActionRequest, ActionVerb, Query};
use crate::Result;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub mod desk;
pub mod dispatch;
pub mod lifecycle;

pub use desk::ActionDesk;
pub use dispatch::{ActionApi, DispatchReceipt, OpsApiClient};

const POLITENESS: &[&str] = &["please ", "kindly ", "can you ", "could you ", "would you "];

const QUOTES: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')];

//
// ================= Verb Lexicon =================
//

/// Lowercase, with surrounding punctuation trimmed.
pub(crate) fn normalize_token(raw: &str) -> String {
    raw.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Supported verb starting at `tokens[at]`, with the number of tokens it spans.
pub(crate) fn match_verb_at(tokens: &[String], at: usize) -> Option<(ActionVerb, usize)> {
    let word = tokens.get(at)?.as_str();
    match word {
        "pause" | "suspend" => Some((ActionVerb::Pause, 1)),
        "unpause" | "resume" | "reactivate" => Some((ActionVerb::Unpause, 1)),
        "update" | "change" | "set" => {
            let next = tokens.get(at + 1).map(String::as_str);
            match next {
                Some("hours") => Some((ActionVerb::UpdateHours, 2)),
                Some("opening") | Some("business")
                    if tokens.get(at + 2).map(String::as_str) == Some("hours") =>
                {
                    Some((ActionVerb::UpdateHours, 3))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Number of leading tokens that are politeness (`please`, `can you`, ...).
pub(crate) fn politeness_len(tokens: &[String]) -> usize {
    let mut i = 0;
    loop {
        match tokens.get(i).map(String::as_str) {
            Some("please") | Some("kindly") | Some("") => i += 1,
            Some("can") | Some("could") | Some("would")
                if tokens.get(i + 1).map(String::as_str) == Some("you") =>
            {
                i += 2
            }
            _ => return i,
        }
    }
}

pub(crate) fn is_open_quote(c: char) -> bool {
    QUOTES.iter().any(|(open, _)| *open == c)
}

/// Whether the word after a verb opens a quoted target.
pub(crate) fn opens_quote(word: Option<&&str>) -> bool {
    word.and_then(|w| w.chars().next())
        .map(is_open_quote)
        .unwrap_or(false)
}

/// First supported verb anywhere in the text that is followed by a quoted
/// target, as in `why did we pause 'x'?`.
fn quoted_verb(raw: &[&str], tokens: &[String]) -> Option<(usize, ActionVerb, usize)> {
    (0..tokens.len()).find_map(|at| {
        let (verb, span) = match_verb_at(tokens, at)?;
        opens_quote(raw.get(at + span)).then_some((at, verb, span))
    })
}

//
// ================= Parser =================
//

#[derive(Debug, Default, Clone, Copy)]
pub struct ActionParser;

impl ActionParser {
    pub fn new() -> Self {
        Self
    }

    /// Produce a `pending` request, or refuse.
    pub fn parse(&self, query: &Query) -> Result<ActionRequest> {
        let (verb, target, parameters) = parse_command(&query.text).map_err(|e| {
            warn!(query_id = %query.query_id, error = %e, "Action parse refused");
            e
        })?;

        let request = ActionRequest::new(query, verb, target, parameters);
        debug!(
            query_id = %query.query_id,
            request_id = %request.request_id,
            verb = %request.verb,
            target = ?request.target,
            "Action request parsed"
        );
        Ok(request)
    }
}

pub type ParsedCommand = (ActionVerb, Option<String>, BTreeMap<String, String>);

pub fn parse_command(text: &str) -> Result<ParsedCommand> {
    let rest = strip_politeness(text.trim());

    let raw: Vec<&str> = rest.split_whitespace().collect();
    let tokens: Vec<String> = raw.iter().map(|w| normalize_token(w)).collect();
    let located = match_verb_at(&tokens, 0)
        .map(|(verb, span)| (0, verb, span))
        .or_else(|| quoted_verb(&raw, &tokens));
    let Some((at, verb, span)) = located else {
        let word = rest
            .split_whitespace()
            .next()
            .map(normalize_token)
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| "(empty)".to_string());
        return Err(OrchestrationError::UnsupportedAction(word));
    };

    let rest = skip_words(rest, at + span);

    match verb {
        ActionVerb::Pause | ActionVerb::Unpause => {
            let (target, parameters) = parse_item_args(verb, rest)?;
            Ok((verb, Some(target), parameters))
        }
        ActionVerb::UpdateHours => {
            let (target, parameters) = parse_hours_args(rest)?;
            Ok((verb, target, parameters))
        }
    }
}

fn strip_politeness(mut text: &str) -> &str {
    'outer: loop {
        for prefix in POLITENESS {
            let matched = text
                .get(..prefix.len())
                .map(|head| head.eq_ignore_ascii_case(prefix))
                .unwrap_or(false);
            if matched {
                text = text[prefix.len()..].trim_start();
                continue 'outer;
            }
        }
        return text;
    }
}

fn skip_words(text: &str, n: usize) -> &str {
    let mut rest = text.trim_start();
    for _ in 0..n {
        rest = match rest.find(char::is_whitespace) {
            Some(i) => rest[i..].trim_start(),
            None => "",
        };
    }
    rest
}

fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end().trim_end_matches(['.', '!', '?', ',', ';']).trim_end()
}

/// Quoted value at the start of `text`, and whatever follows it.
fn take_quoted(text: &str) -> Result<Option<(String, &str)>> {
    let Some(first) = text.chars().next() else {
        return Ok(None);
    };
    let Some((_, close)) = QUOTES.iter().find(|(open, _)| *open == first) else {
        return Ok(None);
    };

    let body = &text[first.len_utf8()..];
    let Some(end) = body.find(*close) else {
        return Err(OrchestrationError::InvalidActionParameters(
            "unterminated quoted target".to_string(),
        ));
    };

    let value = body[..end].trim().to_string();
    if value.is_empty() {
        return Err(OrchestrationError::InvalidActionParameters(
            "quoted target is empty".to_string(),
        ));
    }
    Ok(Some((value, &body[end + close.len_utf8()..])))
}

fn parse_key_values(text: &str) -> Result<BTreeMap<String, String>> {
    let mut parameters = BTreeMap::new();
    for pair in trim_trailing_punct(text).split_whitespace() {
        let pair = pair.trim_end_matches(',');
        let Some((key, value)) = pair.split_once('=') else {
            return Err(OrchestrationError::InvalidActionParameters(format!(
                "expected key=value, got '{}'",
                pair
            )));
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().trim_matches(|c: char| is_open_quote(c) || c == '’' || c == '”');
        if key.is_empty() || value.is_empty() {
            return Err(OrchestrationError::InvalidActionParameters(format!(
                "malformed parameter '{}'",
                pair
            )));
        }
        if parameters.insert(key.clone(), value.to_string()).is_some() {
            return Err(OrchestrationError::InvalidActionParameters(format!(
                "duplicate parameter '{}'",
                key
            )));
        }
    }
    Ok(parameters)
}

fn parse_item_args(verb: ActionVerb, rest: &str) -> Result<(String, BTreeMap<String, String>)> {
    if let Some((target, after)) = take_quoted(rest)? {
        return Ok((target, parse_key_values(after)?));
    }

    let target = trim_trailing_punct(rest);
    if target.is_empty() {
        return Err(OrchestrationError::InvalidActionParameters(format!(
            "{} requires a target, e.g. {} \"Margherita Pizza\"",
            verb, verb
        )));
    }
    Ok((target.to_string(), BTreeMap::new()))
}

fn parse_hours_args(rest: &str) -> Result<(Option<String>, BTreeMap<String, String>)> {
    let mut rest = rest.trim_start();

    let lowered = rest.to_lowercase();
    if lowered.starts_with("for ") {
        rest = rest[4..].trim_start();
    }

    let target = match take_quoted(rest)? {
        Some((target, after)) => {
            rest = after;
            Some(target)
        }
        None => None,
    };

    let (days, open, close) = parse_schedule(trim_trailing_punct(rest))?;

    let mut parameters = BTreeMap::new();
    parameters.insert("days".to_string(), days);
    parameters.insert("open".to_string(), open);
    parameters.insert("close".to_string(), close);
    Ok((target, parameters))
}

//
// ================= Hours Grammar =================
//

const RANGE_WORDS: &[&str] = &["-", "to", "through", "thru", "until", "till"];
const FILLER_WORDS: &[&str] = &["from", "on", "at", "as", "open", "opening", "hours", "and"];

const DAYS: &[(&str, &[&str])] = &[
    ("mon", &["mon", "monday"]),
    ("tue", &["tue", "tues", "tuesday"]),
    ("wed", &["wed", "weds", "wednesday"]),
    ("thu", &["thu", "thur", "thurs", "thursday"]),
    ("fri", &["fri", "friday"]),
    ("sat", &["sat", "saturday"]),
    ("sun", &["sun", "sunday"]),
];

/// Day range and `HH:MM` open/close times from free text or `key=value` form.
fn parse_schedule(text: &str) -> Result<(String, String, String)> {
    let lowered = text.to_lowercase().replace(['–', '—'], "-");

    if lowered.contains('=') {
        return parse_schedule_pairs(&lowered);
    }

    let mut days = None;
    let mut times = None;

    for token in schedule_tokens(&lowered) {
        if let Some(d) = parse_days(&token) {
            if days.replace(d).is_some() {
                return Err(invalid("more than one day range given"));
            }
        } else if let Some((open, close)) = parse_time_range(&token)? {
            if times.replace((open, close)).is_some() {
                return Err(invalid("more than one time range given"));
            }
        } else {
            return Err(invalid(&format!(
                "unrecognized token '{}'; expected e.g. update hours \"Downtown\" mon-fri 09:00-17:00",
                token
            )));
        }
    }

    match (days, times) {
        (Some(days), Some((open, close))) => Ok((days, open, close)),
        _ => Err(invalid("update_hours requires both a day range and a time range")),
    }
}

fn parse_schedule_pairs(text: &str) -> Result<(String, String, String)> {
    let pairs = parse_key_values(text)?;

    let days = pairs
        .get("days")
        .and_then(|d| parse_days(d))
        .ok_or_else(|| invalid("days=<range> is required"))?;

    let (open, close) = match (pairs.get("hours"), pairs.get("open"), pairs.get("close")) {
        (Some(range), _, _) => parse_time_range(range)?
            .ok_or_else(|| invalid(&format!("invalid hours '{}'", range)))?,
        (None, Some(open), Some(close)) => {
            let open = parse_time(open).ok_or_else(|| invalid(&format!("invalid time '{}'", open)))?;
            let close =
                parse_time(close).ok_or_else(|| invalid(&format!("invalid time '{}'", close)))?;
            ordered(open, close)?
        }
        _ => return Err(invalid("hours=<open-close> is required")),
    };

    Ok((days, open, close))
}

/// Collapse `a to b` / `a - b` into `a-b` and drop filler words.
fn schedule_tokens(text: &str) -> Vec<String> {
    let words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches([',', ';']))
        .filter(|w| !w.is_empty())
        .collect();

    let mut tokens: Vec<String> = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let word = words[i];
        if RANGE_WORDS.contains(&word) {
            match (tokens.last_mut(), words.get(i + 1)) {
                (Some(prev), Some(next)) => {
                    prev.push('-');
                    prev.push_str(next);
                    i += 2;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
        }
        if !FILLER_WORDS.contains(&word) {
            tokens.push(word.to_string());
        }
        i += 1;
    }
    tokens
}

fn day_name(word: &str) -> Option<&'static str> {
    DAYS.iter()
        .find(|(_, aliases)| aliases.contains(&word))
        .map(|(short, _)| *short)
}

fn parse_days(token: &str) -> Option<String> {
    match token {
        "daily" | "everyday" => return Some("mon-sun".to_string()),
        "weekdays" => return Some("mon-fri".to_string()),
        "weekends" | "weekend" => return Some("sat-sun".to_string()),
        _ => {}
    }

    match token.split_once('-') {
        Some((from, to)) => {
            let from = day_name(from)?;
            let to = day_name(to)?;
            if from == to {
                Some(from.to_string())
            } else {
                Some(format!("{}-{}", from, to))
            }
        }
        None => day_name(token).map(str::to_string),
    }
}

/// `Ok(None)` when the token is not shaped like a time range at all.
fn parse_time_range(token: &str) -> Result<Option<(String, String)>> {
    let Some((open, close)) = token.split_once('-') else {
        return Ok(None);
    };
    match (parse_time(open), parse_time(close)) {
        (Some(open), Some(close)) => ordered(open, close).map(Some),
        _ => Ok(None),
    }
}

fn ordered(open: (u32, u32), close: (u32, u32)) -> Result<(String, String)> {
    if open >= close {
        return Err(invalid(&format!(
            "opening time {} must be before closing time {}",
            fmt_time(open),
            fmt_time(close)
        )));
    }
    Ok((fmt_time(open), fmt_time(close)))
}

fn fmt_time((h, m): (u32, u32)) -> String {
    format!("{:02}:{:02}", h, m)
}

/// `9`, `9am`, `9:30`, `9:30pm`, `21:00`, `noon`.
fn parse_time(raw: &str) -> Option<(u32, u32)> {
    let raw = raw.trim();
    if raw == "noon" {
        return Some((12, 0));
    }

    let (clock, meridiem) = if let Some(c) = raw.strip_suffix("am") {
        (c.trim_end(), Some(false))
    } else if let Some(c) = raw.strip_suffix("pm") {
        (c.trim_end(), Some(true))
    } else {
        (raw, None)
    };

    let (h, m) = match clock.split_once(':') {
        Some((h, m)) if m.len() == 2 => (h, m),
        Some(_) => return None,
        None => (clock, "00"),
    };
    if h.is_empty() || h.len() > 2 || !h.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !m.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        None if hour <= 23 => hour,
        Some(pm) if (1..=12).contains(&hour) => match (pm, hour) {
            (false, 12) => 0,
            (false, h) => h,
            (true, 12) => 12,
            (true, h) => h + 12,
        },
        _ => return None,
    };
    Some((hour, minute))
}

fn invalid(detail: &str) -> OrchestrationError {
    OrchestrationError::InvalidActionParameters(detail.to_string())
}
