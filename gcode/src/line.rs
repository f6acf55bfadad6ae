use std::collections::HashMap;

use crate::decimal::Decimal;
use crate::parser::{Word, WordValue};

/// A fully parsed G-code line: a command word (e.g. `G1`, `M104`) plus its
/// parameter words in the order they appeared on the line.
#[derive(Clone, Debug, PartialEq)]
pub struct GcodeLine {
    command: GcodeCommand,
    params: HashMap<char, WordValue>,
    params_order: Vec<char>,
}

impl GcodeLine {
    pub fn command(&self) -> &GcodeCommand {
        &self.command
    }

    pub fn params(&self) -> &HashMap<char, WordValue> {
        &self.params
    }

    pub fn param(&self, key: char) -> Option<&WordValue> {
        self.params.get(&key)
    }

    pub fn param_f32(&self, key: char) -> Option<f32> {
        self.params.get(&key).and_then(WordValue::to_f32)
    }

    pub fn param_decimal(&self, key: char) -> Option<Decimal> {
        self.params.get(&key).and_then(WordValue::to_decimal)
    }

    pub fn to_string_spaced(&self) -> String {
        let mut out = self.command.to_string();
        for key in &self.params_order {
            let val = self.params.get(key).unwrap().to_string();
            out.push(' ');
            out.push(*key);
            out.push_str(&val);
        }
        out
    }

    pub fn to_string_compact(&self) -> String {
        let mut out = self.command.to_string();
        for key in &self.params_order {
            let val = self.params.get(key).unwrap().to_string();
            out.push(*key);
            out.push_str(&val);
        }
        out
    }
}

/// The command word of a line: a letter (`G`, `M`, `T`) plus a number, kept
/// as a [`Decimal`] so that e.g. `M862.3` round-trips exactly.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GcodeCommand {
    pub group: char,
    pub number: Decimal,
}

impl GcodeCommand {
    pub fn new<N: Into<Decimal>>(group: char, number: N) -> Self {
        Self {
            group,
            number: number.into(),
        }
    }

    pub fn to_string(&self) -> String {
        format!("{}{}", self.group, self.number)
    }

    /// Integer code, dropping any subcode fraction (`M862.3` -> `862`).
    pub fn code(&self) -> i64 {
        self.number.to_f64() as i64
    }
}

#[derive(Default)]
pub struct GcodeLineBuilder {
    command: Option<GcodeCommand>,
    params: HashMap<char, WordValue>,
    params_order: Vec<char>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BuildLineError {
    #[error("command word has no numeric value")]
    CommandNotNumeric,
    #[error("duplicate parameter {0:?}")]
    DuplicateParameter(char),
}

impl GcodeLineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_word(&mut self, word: Word) -> Result<(), BuildLineError> {
        if self.command.is_none() {
            let number = match word.value {
                WordValue::RealValue(v) => v,
                _ => return Err(BuildLineError::CommandNotNumeric),
            };

            self.command = Some(GcodeCommand {
                group: word.key,
                number,
            });
            return Ok(());
        }

        if self.params.contains_key(&word.key) {
            return Err(BuildLineError::DuplicateParameter(word.key));
        }

        self.params.insert(word.key, word.value);
        self.params_order.push(word.key);
        Ok(())
    }

    pub fn finish(self) -> Option<GcodeLine> {
        let command = self.command?;
        Some(GcodeLine {
            command,
            params: self.params,
            params_order: self.params_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_move_line() {
        let mut builder = GcodeLineBuilder::new();
        builder
            .add_word(Word { key: 'G', value: WordValue::RealValue(1.into()) })
            .unwrap();
        builder
            .add_word(Word { key: 'X', value: WordValue::RealValue("10.5".parse().unwrap()) })
            .unwrap();
        builder
            .add_word(Word { key: 'F', value: WordValue::RealValue(1500.into()) })
            .unwrap();

        let line = builder.finish().unwrap();
        assert_eq!(line.command().group, 'G');
        assert_eq!(line.command().code(), 1);
        assert_eq!(line.to_string_spaced(), "G1 X10.5 F1500");
    }

    #[test]
    fn rejects_duplicate_parameter() {
        let mut builder = GcodeLineBuilder::new();
        builder
            .add_word(Word { key: 'G', value: WordValue::RealValue(1.into()) })
            .unwrap();
        builder
            .add_word(Word { key: 'X', value: WordValue::RealValue(1.into()) })
            .unwrap();
        let err = builder
            .add_word(Word { key: 'X', value: WordValue::RealValue(2.into()) })
            .unwrap_err();
        assert_eq!(err, BuildLineError::DuplicateParameter('X'));
    }

    #[test]
    fn subcode_round_trips() {
        let mut builder = GcodeLineBuilder::new();
        builder
            .add_word(Word { key: 'M', value: WordValue::RealValue("862.3".parse().unwrap()) })
            .unwrap();
        let line = builder.finish().unwrap();
        assert_eq!(line.to_string_compact(), "M862.3");
    }
}
