//! Command codec: validated command construction and reply decoding.
//!
//! A [`CommandSpec`] pairs a wire template with an ordered list of
//! [`ParameterConstraint`]s. [`CommandSpec::build`] validates every argument
//! before the template is rendered, so a wire string is only ever produced for
//! a fully valid argument set.
//!
//! ```
//! use daq_recorder::command::{fs740, Arg};
//!
//! let spec = fs740::catalog().get("measure_frequency").unwrap();
//! assert_eq!(spec.build(&[]).unwrap(), "MEAS1:FREQ? DEF, DEF");
//! assert!(spec.build(&[Arg::Int(1), Arg::Float(2.0e8)]).is_err());
//! ```
//!
//! Templates use `strfmt` named placeholders (`{channel}`, `{expected}`), one
//! per parameter.

pub mod fs740;

use crate::error::{DecodeError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Tokens accepted in place of a numeric argument on most FS740 parameters.
pub const MIN_DEF_MAX: &[&str] = &["DEF", "MIN", "MAX"];

/// SCPI's numeric stand-in for "not a number".
pub const SCPI_NAN: f64 = 9.91e37;

/// Field separator of multi-value replies.
pub const FIELD_SEPARATOR: char = ',';

/// A typed command argument.
///
/// Deserializes untagged so configuration files can write `1`, `2.5e6` or
/// `"DEF"` directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Token(String),
}

impl Arg {
    pub fn token(token: impl Into<String>) -> Self {
        Arg::Token(token.into())
    }

    /// Numeric value of an integer or float argument.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(v) => Some(*v as f64),
            Arg::Float(v) => Some(*v),
            Arg::Token(_) => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Arg::Int(_) => "integer",
            Arg::Float(_) => "float",
            Arg::Token(_) => "token",
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{}", v),
            Arg::Float(v) => write!(f, "{}", v),
            Arg::Token(t) => write!(f, "{}", t),
        }
    }
}

impl FromStr for Arg {
    type Err = std::convert::Infallible;

    /// Integers first, then floats; anything else is a token.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(v) = s.parse::<i64>() {
            Ok(Arg::Int(v))
        } else if let Ok(v) = s.parse::<f64>() {
            Ok(Arg::Float(v))
        } else {
            Ok(Arg::Token(s.to_string()))
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Token(v.to_string())
    }
}

/// Semantic kind of a parameter and its bounds.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintKind {
    /// Integer or float within inclusive bounds.
    NumericRange { min: f64, max: f64 },
    /// Exact, case-sensitive member of the token set.
    Tokens(Vec<String>),
    /// Integer (never a truncated float) within inclusive bounds.
    IntegerBound { min: i64, max: i64 },
}

/// Declared constraint for one command argument.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterConstraint {
    name: String,
    kind: ConstraintKind,
    sentinels: Vec<String>,
    default: Option<Arg>,
}

impl ParameterConstraint {
    pub fn numeric(name: &str, min: f64, max: f64) -> Self {
        Self::with_kind(name, ConstraintKind::NumericRange { min, max })
    }

    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self::with_kind(name, ConstraintKind::IntegerBound { min, max })
    }

    pub fn tokens(name: &str, tokens: &[&str]) -> Self {
        Self::with_kind(
            name,
            ConstraintKind::Tokens(tokens.iter().map(|t| t.to_string()).collect()),
        )
    }

    fn with_kind(name: &str, kind: ConstraintKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            sentinels: Vec::new(),
            default: None,
        }
    }

    /// Accept these tokens in place of a value, bypassing the range check.
    pub fn with_sentinels(mut self, sentinels: &[&str]) -> Self {
        self.sentinels = sentinels.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Value used when the argument is omitted. Defaults are validated like
    /// any other argument.
    pub fn with_default(mut self, default: impl Into<Arg>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    pub fn sentinels(&self) -> &[String] {
        &self.sentinels
    }

    pub fn default_value(&self) -> Option<&Arg> {
        self.default.as_ref()
    }

    fn is_sentinel(&self, arg: &Arg) -> bool {
        matches!(arg, Arg::Token(t) if self.sentinels.iter().any(|s| s == t))
    }

    /// Check `arg` against this constraint.
    pub fn validate(&self, command: &str, arg: &Arg) -> Result<(), ValidationError> {
        if self.is_sentinel(arg) {
            return Ok(());
        }

        match (&self.kind, arg) {
            (ConstraintKind::NumericRange { min, max }, Arg::Int(_) | Arg::Float(_)) => {
                let value = arg.as_f64().unwrap_or(f64::NAN);
                // NaN fails both comparisons, so test for containment.
                if value >= *min && value <= *max {
                    Ok(())
                } else {
                    Err(self.out_of_range(command, arg, min, max))
                }
            }
            (ConstraintKind::IntegerBound { min, max }, Arg::Int(v)) => {
                if v >= min && v <= max {
                    Ok(())
                } else {
                    Err(self.out_of_range(command, arg, min, max))
                }
            }
            (ConstraintKind::Tokens(allowed), Arg::Token(token)) => {
                if allowed.iter().any(|a| a == token) {
                    Ok(())
                } else {
                    Err(ValidationError::UnknownToken {
                        command: command.to_string(),
                        parameter: self.name.clone(),
                        token: token.clone(),
                        allowed: allowed.clone(),
                    })
                }
            }
            (ConstraintKind::Tokens(allowed), _) => Err(ValidationError::UnknownToken {
                command: command.to_string(),
                parameter: self.name.clone(),
                token: arg.to_string(),
                allowed: allowed.clone(),
            }),
            (kind, _) => Err(ValidationError::WrongKind {
                command: command.to_string(),
                parameter: self.name.clone(),
                expected: self.describe_expected(kind),
                got: format!("{} '{}'", arg.kind_name(), arg),
            }),
        }
    }

    fn describe_expected(&self, kind: &ConstraintKind) -> String {
        let base = match kind {
            ConstraintKind::NumericRange { .. } => "a number".to_string(),
            ConstraintKind::IntegerBound { .. } => "an integer".to_string(),
            ConstraintKind::Tokens(tokens) => format!("one of {:?}", tokens),
        };
        if self.sentinels.is_empty() {
            base
        } else {
            format!("{} or one of {:?}", base, self.sentinels)
        }
    }

    fn out_of_range<T: fmt::Display>(
        &self,
        command: &str,
        arg: &Arg,
        min: &T,
        max: &T,
    ) -> ValidationError {
        ValidationError::OutOfRange {
            command: command.to_string(),
            parameter: self.name.clone(),
            value: arg.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}

/// Expected layout of a query reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyShape {
    /// No reply is read (set commands).
    None,
    /// One numeric value.
    Scalar,
    /// A fixed number of comma-separated numeric values.
    List(usize),
    /// Free text, returned verbatim (e.g. `*IDN?`).
    Text,
}

impl ReplyShape {
    /// Shape matching a list of configured field names.
    pub fn for_fields(count: usize) -> Self {
        if count == 1 {
            ReplyShape::Scalar
        } else {
            ReplyShape::List(count)
        }
    }
}

/// A decoded reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Empty,
    Scalar(f64),
    List(Vec<f64>),
    Text(String),
}

impl Reply {
    /// Numeric values in reply order.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Reply::Scalar(v) => vec![*v],
            Reply::List(values) => values.clone(),
            Reply::Empty | Reply::Text(_) => Vec::new(),
        }
    }
}

/// An instrument command: name, wire template, ordered parameters and the
/// shape of its reply.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandSpec {
    name: String,
    template: String,
    params: Vec<ParameterConstraint>,
    reply: ReplyShape,
    description: String,
}

impl CommandSpec {
    pub fn new(name: &str, template: &str) -> Self {
        let reply = if template.contains('?') {
            ReplyShape::Scalar
        } else {
            ReplyShape::None
        };
        Self {
            name: name.to_string(),
            template: template.to_string(),
            params: Vec::new(),
            reply,
            description: String::new(),
        }
    }

    pub fn param(mut self, constraint: ParameterConstraint) -> Self {
        self.params.push(constraint);
        self
    }

    pub fn reply(mut self, shape: ReplyShape) -> Self {
        self.reply = shape;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn params(&self) -> &[ParameterConstraint] {
        &self.params
    }

    pub fn reply_shape(&self) -> ReplyShape {
        self.reply
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the instrument answers this command.
    pub fn is_query(&self) -> bool {
        self.reply != ReplyShape::None
    }

    /// Validate positional arguments and render the wire string.
    ///
    /// Omitted trailing arguments take their declared default. All arguments
    /// are validated before anything is formatted.
    pub fn build(&self, args: &[Arg]) -> Result<String, ValidationError> {
        if args.len() > self.params.len() {
            return Err(ValidationError::TooManyArguments {
                command: self.name.clone(),
                expected: self.params.len(),
                got: args.len(),
            });
        }

        let mut resolved: Vec<&Arg> = Vec::with_capacity(self.params.len());
        for (index, param) in self.params.iter().enumerate() {
            let arg = args
                .get(index)
                .or(param.default.as_ref())
                .ok_or_else(|| ValidationError::MissingArgument {
                    command: self.name.clone(),
                    parameter: param.name.clone(),
                })?;
            param.validate(&self.name, arg)?;
            resolved.push(arg);
        }

        self.render(&resolved)
    }

    /// Validate arguments given by parameter name and render the wire string.
    pub fn build_named(&self, args: &BTreeMap<String, Arg>) -> Result<String, ValidationError> {
        if let Some(unknown) = args
            .keys()
            .find(|key| !self.params.iter().any(|p| &p.name == *key))
        {
            return Err(ValidationError::UnknownParameter {
                command: self.name.clone(),
                parameter: unknown.clone(),
            });
        }

        let mut resolved: Vec<&Arg> = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let arg = args
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| ValidationError::MissingArgument {
                    command: self.name.clone(),
                    parameter: param.name.clone(),
                })?;
            param.validate(&self.name, arg)?;
            resolved.push(arg);
        }

        self.render(&resolved)
    }

    fn render(&self, resolved: &[&Arg]) -> Result<String, ValidationError> {
        let vars: HashMap<String, String> = self
            .params
            .iter()
            .zip(resolved)
            .map(|(param, arg)| (param.name.clone(), arg.to_string()))
            .collect();

        strfmt::strfmt(&self.template, &vars).map_err(|e| ValidationError::Template {
            command: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode a reply to this command using its declared shape.
    pub fn decode(&self, reply: &str) -> Result<Reply, DecodeError> {
        decode(reply, self.reply)
    }
}

/// Parse an instrument reply into the requested shape.
pub fn decode(reply: &str, shape: ReplyShape) -> Result<Reply, DecodeError> {
    let trimmed = reply.trim();

    match shape {
        ReplyShape::None => Ok(Reply::Empty),
        ReplyShape::Text => {
            if trimmed.is_empty() {
                Err(DecodeError::EmptyReply)
            } else {
                Ok(Reply::Text(trimmed.to_string()))
            }
        }
        ReplyShape::Scalar => {
            let values = parse_fields(trimmed)?;
            match values.as_slice() {
                [value] => Ok(Reply::Scalar(*value)),
                _ => Err(DecodeError::FieldCount {
                    expected: 1,
                    got: values.len(),
                }),
            }
        }
        ReplyShape::List(expected) => {
            let values = parse_fields(trimmed)?;
            if values.len() == expected {
                Ok(Reply::List(values))
            } else {
                Err(DecodeError::FieldCount {
                    expected,
                    got: values.len(),
                })
            }
        }
    }
}

fn parse_fields(reply: &str) -> Result<Vec<f64>, DecodeError> {
    if reply.is_empty() {
        return Err(DecodeError::EmptyReply);
    }

    reply
        .split(FIELD_SEPARATOR)
        .enumerate()
        .map(|(index, raw)| {
            let raw = raw.trim();
            if raw.eq_ignore_ascii_case("nan") {
                return Err(DecodeError::NotANumber { index });
            }
            let value = raw.parse::<f64>().map_err(|_| DecodeError::NotNumeric {
                index,
                raw: raw.to_string(),
            })?;
            if value.is_nan() || value == SCPI_NAN {
                Err(DecodeError::NotANumber { index })
            } else {
                Ok(value)
            }
        })
        .collect()
}

/// Extract the identity to compare from an `*IDN?` reply.
///
/// With `field = Some(n)` the n-th comma-separated field (0-based) is used,
/// otherwise the whole trimmed reply.
pub fn decode_identity(reply: &str, field: Option<usize>) -> Result<String, DecodeError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::EmptyReply);
    }

    match field {
        None => Ok(trimmed.to_string()),
        Some(index) => trimmed
            .split(FIELD_SEPARATOR)
            .nth(index)
            .map(|f| f.trim().to_string())
            .ok_or_else(|| DecodeError::MissingField {
                index,
                reply: trimmed.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frequency_param() -> ParameterConstraint {
        ParameterConstraint::numeric("expected", 0.1, 1.5e8)
            .with_sentinels(MIN_DEF_MAX)
            .with_default("DEF")
    }

    #[test]
    fn test_numeric_bounds_are_inclusive() {
        let p = frequency_param();
        assert!(p.validate("t", &Arg::Float(0.1)).is_ok());
        assert!(p.validate("t", &Arg::Float(1.5e8)).is_ok());
        assert!(p.validate("t", &Arg::Int(10_000_000)).is_ok());
    }

    #[test]
    fn test_numeric_outside_bounds_rejected() {
        let p = frequency_param();
        for value in [0.09, -1.0, 1.5e8 + 1.0, f64::INFINITY, f64::NAN] {
            let err = p.validate("t", &Arg::Float(value)).unwrap_err();
            assert!(
                matches!(err, ValidationError::OutOfRange { .. }),
                "{} gave {:?}",
                value,
                err
            );
        }
    }

    #[test]
    fn test_sentinels_bypass_range() {
        let p = ParameterConstraint::numeric("gate", 1e-2, 1e3).with_sentinels(MIN_DEF_MAX);
        for token in MIN_DEF_MAX {
            assert!(p.validate("t", &Arg::token(*token)).is_ok());
        }
        // Sentinels are case-sensitive.
        assert!(matches!(
            p.validate("t", &Arg::token("def")),
            Err(ValidationError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_token_set_is_case_sensitive() {
        let p = ParameterConstraint::tokens("slope", &["NEG", "POS", "DEF"]);
        assert!(p.validate("t", &Arg::token("POS")).is_ok());
        assert!(matches!(
            p.validate("t", &Arg::token("pos")),
            Err(ValidationError::UnknownToken { .. })
        ));
        assert!(matches!(
            p.validate("t", &Arg::Int(1)),
            Err(ValidationError::UnknownToken { .. })
        ));
    }

    #[test]
    fn test_integer_bound_rejects_fractional_input() {
        let p = ParameterConstraint::integer("location", 0, 9);
        assert!(p.validate("t", &Arg::Int(0)).is_ok());
        assert!(p.validate("t", &Arg::Int(9)).is_ok());
        assert!(matches!(
            p.validate("t", &Arg::Float(3.0)),
            Err(ValidationError::WrongKind { .. })
        ));
        assert!(matches!(
            p.validate("t", &Arg::Int(10)),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_build_is_all_or_nothing() {
        let spec = CommandSpec::new("conf", "CONF{channel}:FREQ {expected}, {resolution}")
            .param(ParameterConstraint::integer("channel", 1, 2).with_default(1))
            .param(frequency_param())
            .param(
                ParameterConstraint::numeric("resolution", 1e-16, 1.5e-2)
                    .with_sentinels(MIN_DEF_MAX)
                    .with_default("DEF"),
            );

        assert_eq!(spec.build(&[]).unwrap(), "CONF1:FREQ DEF, DEF");
        assert_eq!(
            spec.build(&[Arg::Int(2), Arg::Float(10e6), Arg::token("MIN")])
                .unwrap(),
            "CONF2:FREQ 10000000, MIN"
        );
        // Valid first arguments do not leak out when a later one fails.
        assert!(spec
            .build(&[Arg::Int(1), Arg::Float(10e6), Arg::Float(1.0)])
            .is_err());
        assert!(matches!(
            spec.build(&[Arg::Int(1), Arg::Int(1), Arg::Int(1), Arg::Int(1)]),
            Err(ValidationError::TooManyArguments { .. })
        ));
    }

    #[test]
    fn test_missing_required_argument() {
        let spec = CommandSpec::new("rcl", "*RCL {location}")
            .param(ParameterConstraint::integer("location", 0, 9));
        assert!(matches!(
            spec.build(&[]),
            Err(ValidationError::MissingArgument { .. })
        ));
        assert_eq!(spec.build(&[Arg::Int(3)]).unwrap(), "*RCL 3");
    }

    #[test]
    fn test_build_named() {
        let spec = CommandSpec::new("lev", "INP{channel}:LEV {level}")
            .param(ParameterConstraint::integer("channel", 1, 2).with_default(1))
            .param(ParameterConstraint::numeric("level", -3.0, 3.0));

        let mut args = BTreeMap::new();
        args.insert("level".to_string(), Arg::Float(-1.25));
        assert_eq!(spec.build_named(&args).unwrap(), "INP1:LEV -1.25");

        args.insert("lvl".to_string(), Arg::Float(0.0));
        assert!(matches!(
            spec.build_named(&args),
            Err(ValidationError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_decode_scalar() {
        assert_eq!(
            decode("1.0000000012E+07\r\n", ReplyShape::Scalar).unwrap(),
            Reply::Scalar(1.0000000012e7)
        );
        assert!(matches!(
            decode("abc", ReplyShape::Scalar),
            Err(DecodeError::NotNumeric { index: 0, .. })
        ));
        assert!(matches!(
            decode("", ReplyShape::Scalar),
            Err(DecodeError::EmptyReply)
        ));
        assert!(matches!(
            decode("NAN", ReplyShape::Scalar),
            Err(DecodeError::NotANumber { index: 0 })
        ));
    }

    #[test]
    fn test_decode_statistics_list() {
        let reply = "1.0E+07,2.3E-12,9.99999E+06,1.00001E+07,100";
        let decoded = decode(reply, ReplyShape::List(5)).unwrap();
        assert_eq!(
            decoded.values(),
            vec![1.0e7, 2.3e-12, 9.99999e6, 1.00001e7, 100.0]
        );
        assert!(matches!(
            decode("1,2,3", ReplyShape::List(5)),
            Err(DecodeError::FieldCount { expected: 5, got: 3 })
        ));
    }

    #[test]
    fn test_decode_identity_field() {
        let idn = "Stanford Research Systems,FS740,s/n001234,ver1.08\r\n";
        assert_eq!(decode_identity(idn, Some(1)).unwrap(), "FS740");
        assert_eq!(
            decode_identity(idn, None).unwrap(),
            "Stanford Research Systems,FS740,s/n001234,ver1.08"
        );
        assert!(matches!(
            decode_identity("FS740", Some(3)),
            Err(DecodeError::MissingField { index: 3, .. })
        ));
    }

    #[test]
    fn test_arg_from_str() {
        assert_eq!("2".parse::<Arg>().unwrap(), Arg::Int(2));
        assert_eq!("1e7".parse::<Arg>().unwrap(), Arg::Float(1.0e7));
        assert_eq!(" DEF ".parse::<Arg>().unwrap(), Arg::token("DEF"));
    }
}
