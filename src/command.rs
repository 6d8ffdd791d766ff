//! Operator commands, e.g. `summarize all` or `summarize 2024-01-05`.

use crate::engine::{EngineError, EngineHandle};
use crate::model::timefmt::DEVICE_DATE;
use thiserror::Error;
use time::Date;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`summarize` expects `all` or a YYYY-MM-DD date, got `{0}`")]
    InvalidArgument(String),
    #[error("`{0}` takes exactly one argument")]
    ArgumentCount(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    SummarizeAll,
    SummarizeDay(Date),
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        if !verb.eq_ignore_ascii_case("summarize") {
            return Err(CommandError::Unknown(verb.to_string()));
        }
        let (Some(argument), None) = (words.next(), words.next()) else {
            return Err(CommandError::ArgumentCount(verb.to_string()));
        };
        if argument.eq_ignore_ascii_case("all") {
            return Ok(Self::SummarizeAll);
        }
        Date::parse(argument, DEVICE_DATE)
            .map(Self::SummarizeDay)
            .map_err(|_| CommandError::InvalidArgument(argument.to_string()))
    }

    pub fn submit(self, engine: &EngineHandle) -> Result<(), EngineError> {
        match self {
            Self::SummarizeAll => engine.request_summarize(None),
            Self::SummarizeDay(date) => engine.request_summarize(Some(date)),
        }
    }
}
