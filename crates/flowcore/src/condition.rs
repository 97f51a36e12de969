//! Conditional execution predicates
//!
//! A node can gate itself on the terminal statuses of its direct predecessors
//! ([`ConditionOnJobStatus`]) and on values they emitted as output properties
//! ([`PropertyCondition`]).

use crate::error::ConditionError;
use crate::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Predicate over the terminal statuses of a node's predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOnJobStatus {
    #[default]
    AllSuccess,
    AllFailed,
    AllDone,
    OneFailed,
    OneSuccess,
}

/// Result of checking a status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// At least one predecessor has not finished yet.
    Pending,
    Satisfied,
    Unsatisfied,
}

impl ConditionOnJobStatus {
    /// Evaluate against predecessor statuses. Nothing is decided until every
    /// predecessor is terminal.
    pub fn evaluate(self, predecessors: &[Status]) -> ConditionOutcome {
        if predecessors.iter().any(|s| !s.is_terminal()) {
            return ConditionOutcome::Pending;
        }
        if predecessors.is_empty() {
            return ConditionOutcome::Satisfied;
        }

        let satisfied = match self {
            ConditionOnJobStatus::AllSuccess => predecessors.iter().all(|s| !s.is_failure()),
            ConditionOnJobStatus::AllFailed => predecessors.iter().all(|s| s.is_failure()),
            ConditionOnJobStatus::AllDone => true,
            ConditionOnJobStatus::OneFailed => predecessors.iter().any(|s| s.is_failure()),
            ConditionOnJobStatus::OneSuccess => predecessors.iter().any(|s| *s == Status::Succeeded),
        };

        if satisfied {
            ConditionOutcome::Satisfied
        } else {
            ConditionOutcome::Unsatisfied
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }

    fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Ne => actual != expected,
            ordered => match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => match ordered {
                    Comparison::Gt => a > b,
                    Comparison::Ge => a >= b,
                    Comparison::Lt => a < b,
                    _ => a <= b,
                },
                _ => false,
            },
        }
    }
}

/// `${job:key} <op> 'value'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub job: String,
    pub key: String,
    pub op: Comparison,
    pub value: String,
}

impl Clause {
    fn evaluate<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str, &str) -> Option<&'a str>,
    {
        let actual = lookup(&self.job, &self.key).unwrap_or("");
        self.op.apply(actual, &self.value)
    }
}

/// Predicate over predecessor output properties.
///
/// Kept as the disjunction of conjunctions parsed from an expression such as
/// `${jobA:key1} == 'value1' && ${jobB:key2} != 'x' || ${jobC:done} == 'true'`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PropertyCondition {
    expression: String,
    any_of: Vec<Vec<Clause>>,
}

impl PropertyCondition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let any_of = Parser::new(expression).parse()?;
        Ok(Self {
            expression: expression.trim().to_string(),
            any_of,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Jobs whose outputs the condition reads.
    pub fn referenced_jobs(&self) -> impl Iterator<Item = &str> {
        self.any_of
            .iter()
            .flat_map(|all| all.iter().map(|c| c.job.as_str()))
    }

    /// `lookup(job, key)` resolves a predecessor output property; a missing
    /// value compares as the empty string.
    pub fn evaluate<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&str, &str) -> Option<&'a str>,
    {
        self.any_of
            .iter()
            .any(|all| all.iter().all(|clause| clause.evaluate(&lookup)))
    }
}

impl FromStr for PropertyCondition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PropertyCondition {
    type Error = ConditionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PropertyCondition> for String {
    fn from(condition: PropertyCondition) -> Self {
        condition.expression
    }
}

impl fmt::Display for PropertyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .any_of
            .iter()
            .map(|all| {
                all.iter()
                    .map(|c| format!("${{{}:{}}} {} '{}'", c.job, c.key, c.op.symbol(), c.value))
                    .collect::<Vec<_>>()
                    .join(" && ")
            })
            .collect();
        f.write_str(&rendered.join(" || "))
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<Vec<Vec<Clause>>, ConditionError> {
        let mut any_of = Vec::new();
        let mut all_of = vec![self.clause()?];
        loop {
            self.skip_ws();
            if self.rest().is_empty() {
                break;
            }
            if self.eat("&&") {
                all_of.push(self.clause()?);
            } else if self.eat("||") {
                any_of.push(std::mem::take(&mut all_of));
                all_of.push(self.clause()?);
            } else {
                return Err(self.error("expected '&&' or '||'"));
            }
        }
        any_of.push(all_of);
        Ok(any_of)
    }

    fn clause(&mut self) -> Result<Clause, ConditionError> {
        self.skip_ws();
        if !self.eat("${") {
            return Err(self.error("expected '${job:key}'"));
        }
        let end = self
            .rest()
            .find('}')
            .ok_or_else(|| self.error("unterminated '${'"))?;
        let reference = &self.rest()[..end];
        self.pos += end + 1;

        let (job, key) = reference
            .split_once(':')
            .ok_or_else(|| self.error("reference must look like ${job:key}"))?;
        if job.trim().is_empty() || key.trim().is_empty() {
            return Err(self.error("empty job or key in reference"));
        }

        self.skip_ws();
        let op = self.comparison()?;
        self.skip_ws();
        let value = self.literal()?;

        Ok(Clause {
            job: job.trim().to_string(),
            key: key.trim().to_string(),
            op,
            value,
        })
    }

    fn comparison(&mut self) -> Result<Comparison, ConditionError> {
        // two-character operators first so '>=' is not read as '>'
        for (token, op) in [
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
        ] {
            if self.eat(token) {
                return Ok(op);
            }
        }
        Err(self.error("expected a comparison operator"))
    }

    fn literal(&mut self) -> Result<String, ConditionError> {
        let rest = self.rest();
        match rest.chars().next() {
            Some(quote @ ('\'' | '"')) => {
                let body = &rest[1..];
                let end = body
                    .find(quote)
                    .ok_or_else(|| self.error("unterminated string literal"))?;
                let value = body[..end].to_string();
                self.pos += end + 2;
                Ok(value)
            }
            Some(_) => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '&' || c == '|')
                    .unwrap_or(rest.len());
                let value = rest[..end].to_string();
                self.pos += end;
                Ok(value)
            }
            None => Err(self.error("expected a value")),
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn error(&self, message: &str) -> ConditionError {
        ConditionError::Parse {
            expression: self.input.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn outputs() -> HashMap<(&'static str, &'static str), &'static str> {
        HashMap::from([
            (("jobA", "key1"), "value1"),
            (("jobA", "key2"), "value2"),
            (("jobB", "count"), "12"),
        ])
    }

    fn eval(expr: &str) -> bool {
        let outputs = outputs();
        PropertyCondition::parse(expr)
            .unwrap()
            .evaluate(|job, key| outputs.iter().find(|((j, k), _)| *j == job && *k == key).map(|(_, v)| *v))
    }

    #[test]
    fn status_conditions_wait_for_every_predecessor() {
        let running = [Status::Succeeded, Status::Running];
        for condition in [
            ConditionOnJobStatus::AllSuccess,
            ConditionOnJobStatus::OneSuccess,
            ConditionOnJobStatus::OneFailed,
        ] {
            assert_eq!(condition.evaluate(&running), ConditionOutcome::Pending);
        }
    }

    #[test]
    fn status_conditions() {
        use ConditionOnJobStatus::*;
        use ConditionOutcome::*;

        let mixed = [Status::Succeeded, Status::Failed];
        assert_eq!(AllSuccess.evaluate(&mixed), Unsatisfied);
        assert_eq!(AllFailed.evaluate(&mixed), Unsatisfied);
        assert_eq!(AllDone.evaluate(&mixed), Satisfied);
        assert_eq!(OneFailed.evaluate(&mixed), Satisfied);
        assert_eq!(OneSuccess.evaluate(&mixed), Satisfied);

        let failed = [Status::Failed, Status::Killed];
        assert_eq!(AllFailed.evaluate(&failed), Satisfied);
        assert_eq!(OneSuccess.evaluate(&failed), Unsatisfied);

        let skipped = [Status::Skipped, Status::Succeeded];
        assert_eq!(AllSuccess.evaluate(&skipped), Satisfied);
        assert_eq!(AllSuccess.evaluate(&[]), Satisfied);
    }

    #[test]
    fn property_conditions() {
        assert!(eval("${jobA:key1} == 'value1'"));
        assert!(!eval("${jobA:key1} == \"other\""));
        assert!(eval("${jobA:key1} == 'value1' && ${jobA:key2} != 'value3'"));
        assert!(!eval("${jobA:key1} == 'nope' && ${jobA:key2} == 'value2'"));
        assert!(eval("${jobA:key1} == 'nope' || ${jobA:key2} == 'value2'"));
        assert!(eval("${jobB:count} > 10 && ${jobB:count} <= 12"));
        assert!(eval("${jobA:missing} == ''"));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // (false && true) || true
        assert!(eval("${jobA:key1} == 'x' && ${jobA:key2} == 'value2' || ${jobB:count} == 12"));
        // false || (true && false)
        assert!(!eval("${jobA:key1} == 'x' || ${jobA:key2} == 'value2' && ${jobB:count} == 1"));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "jobA == 'x'",
            "${jobA} == 'x'",
            "${jobA:key1} ~ 'x'",
            "${jobA:key1} == 'x",
            "${jobA:key1} == 'x' and ${jobA:key2} == 'y'",
        ] {
            assert!(PropertyCondition::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn serde_uses_the_expression_string() {
        let condition = PropertyCondition::parse("${jobA:key1} == 'value1'").unwrap();
        let json = serde_json::to_string(&condition).unwrap();
        assert_eq!(json, "\"${jobA:key1} == 'value1'\"");
        let back: PropertyCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, condition);
        assert_eq!(back.referenced_jobs().collect::<Vec<_>>(), vec!["jobA"]);
    }
}
