//! Response predicates.
//!
//! Every check returns `Ok(())` when it holds and an [`AssertionFailure`] naming the expected
//! and actual values when it doesn't. [`Check`] is the closed set of single-response checks
//! that scenarios can name in data.

use crate::query::{Flag, Response, Status};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use trust_dns_proto::rr::Record;

/// A predicate that did not hold.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{check} failed: expected {expected}, got {actual}")]
pub struct AssertionFailure {
    pub check: String,
    pub expected: String,
    pub actual: String,
}

impl AssertionFailure {
    fn new(check: impl Into<String>, expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self {
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

type CheckResult = Result<(), AssertionFailure>;

/// Check the response status.
///
/// # Errors
///
/// Returns an [`AssertionFailure`] if the RCODE differs from `expected`.
pub fn rcode(res: &Response, expected: Status) -> CheckResult {
    let actual = res.status();
    if actual == expected {
        Ok(())
    } else {
        Err(AssertionFailure::new("rcode", expected, actual))
    }
}

/// # Errors
///
/// Returns an [`AssertionFailure`] unless the status is `NOERROR`.
pub fn noerror(res: &Response) -> CheckResult {
    rcode(res, Status::NoError)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] unless the status is `SERVFAIL`.
pub fn servfail(res: &Response) -> CheckResult {
    rcode(res, Status::ServFail)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] unless the status is `NXDOMAIN`.
pub fn nxdomain(res: &Response) -> CheckResult {
    rcode(res, Status::NXDomain)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] unless the status is `REFUSED`.
pub fn refused(res: &Response) -> CheckResult {
    rcode(res, Status::Refused)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] if `flag` is clear.
pub fn flag_set(res: &Response, flag: Flag) -> CheckResult {
    if res.has_flag(flag) {
        Ok(())
    } else {
        Err(AssertionFailure::new(
            format!("{flag} flag"),
            format!("{flag} set"),
            flags_display(res),
        ))
    }
}

/// # Errors
///
/// Returns an [`AssertionFailure`] if `flag` is set.
pub fn flag_clear(res: &Response, flag: Flag) -> CheckResult {
    if res.has_flag(flag) {
        Err(AssertionFailure::new(
            format!("{flag} flag"),
            format!("{flag} clear"),
            flags_display(res),
        ))
    } else {
        Ok(())
    }
}

/// # Errors
///
/// Returns an [`AssertionFailure`] unless the response was validated (`AD` set).
pub fn adflag(res: &Response) -> CheckResult {
    flag_set(res, Flag::AD)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] if the response claims validation (`AD` set).
pub fn noadflag(res: &Response) -> CheckResult {
    flag_clear(res, Flag::AD)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] if the answer section is not empty.
pub fn empty_answer(res: &Response) -> CheckResult {
    rr_count_eq(res.answers(), 0)
}

/// # Errors
///
/// Returns an [`AssertionFailure`] if `records` does not hold exactly `expected` records.
pub fn rr_count_eq(records: &[Record], expected: usize) -> CheckResult {
    if records.len() == expected {
        Ok(())
    } else {
        Err(AssertionFailure::new(
            "record count",
            expected,
            records.len(),
        ))
    }
}

/// Compare the answer sections of two independent exchanges as sets.
///
/// Records are compared by owner, class, type and rdata; order and TTLs are ignored.
///
/// # Errors
///
/// Returns an [`AssertionFailure`] listing both answer sets when they differ.
pub fn same_answer(r1: &Response, r2: &Response) -> CheckResult {
    let left = answer_set(r1);
    let right = answer_set(r2);
    if left == right {
        Ok(())
    } else {
        Err(AssertionFailure::new(
            "same answer",
            set_display(&left),
            set_display(&right),
        ))
    }
}

fn answer_set(res: &Response) -> BTreeSet<String> {
    res.answers()
        .iter()
        .map(|rr| {
            let rdata = rr.data().map_or(String::new(), ToString::to_string);
            format!(
                "{} {} {} {}",
                rr.name().to_lowercase(),
                rr.dns_class(),
                rr.record_type(),
                rdata
            )
        })
        .collect()
}

fn set_display(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        return "no records".to_string();
    }
    set.iter().cloned().collect::<Vec<_>>().join("; ")
}

fn flags_display(res: &Response) -> String {
    let flags: Vec<String> = res.flags().iter().map(ToString::to_string).collect();
    format!("flags [{}]", flags.join(" "))
}

/// Single-response checks that can be named in scenario files.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Status(Status),
    FlagSet(Flag),
    FlagClear(Flag),
    EmptyAnswer,
    AnswerCount(usize),
}

impl Check {
    /// Run the check against `res`.
    ///
    /// # Errors
    ///
    /// Returns the [`AssertionFailure`] of the underlying predicate.
    pub fn evaluate(&self, res: &Response) -> CheckResult {
        match self {
            Check::Status(status) => rcode(res, *status),
            Check::FlagSet(flag) => flag_set(res, *flag),
            Check::FlagClear(flag) => flag_clear(res, *flag),
            Check::EmptyAnswer => empty_answer(res),
            Check::AnswerCount(n) => rr_count_eq(res.answers(), *n),
        }
    }

    #[must_use]
    pub fn holds(&self, res: &Response) -> bool {
        self.evaluate(res).is_ok()
    }
}
