use std::fmt;

use serde::Serialize;

use crate::error::{CoreError, CoreResult};

// ---

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }

    /// Direction of the alarm: `Some(true)` for "too low", `Some(false)`
    /// for "too high", `None` for equality checks.
    fn low_side(&self) -> Option<bool> {
        match self {
            Operator::Lt | Operator::Le => Some(true),
            Operator::Gt | Operator::Ge => Some(false),
            Operator::Eq | Operator::Ne => None,
        }
    }
}

/// `<field> <op> <threshold>`, e.g. `temperature < 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub threshold: f64,
}

impl Condition {
    // ---
    pub fn parse(expr: &str) -> CoreResult<Self> {
        // ---
        let expr = expr.trim();
        let op_at = expr
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| CoreError::invalid_rule(format!("no comparison operator in '{expr}'")))?;

        let field = expr[..op_at].trim();
        if field.is_empty()
            || !field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || field.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(CoreError::invalid_rule(format!(
                "invalid field name '{field}' in '{expr}'"
            )));
        }

        let rest = &expr[op_at..];
        let (op, len) = [
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ]
        .into_iter()
        .find(|(token, _)| rest.starts_with(token))
        .map(|(token, op)| (op, token.len()))
        .ok_or_else(|| CoreError::invalid_rule(format!("unsupported operator in '{expr}'")))?;

        let number = rest[len..].trim();
        let threshold: f64 = number
            .parse()
            .map_err(|_| CoreError::invalid_rule(format!("invalid threshold '{number}' in '{expr}'")))?;
        if !threshold.is_finite() {
            return Err(CoreError::invalid_rule(format!(
                "threshold must be finite in '{expr}'"
            )));
        }

        Ok(Condition {
            field: field.to_string(),
            op,
            threshold,
        })
    }

    /// Plain evaluation, without hysteresis.
    pub fn holds(&self, value: f64) -> bool {
        let t = self.threshold;
        match self.op {
            Operator::Lt => value < t,
            Operator::Le => value <= t,
            Operator::Gt => value > t,
            Operator::Ge => value >= t,
            Operator::Eq => value == t,
            Operator::Ne => value != t,
        }
    }

    pub fn supports_hysteresis(&self) -> bool {
        self.op.low_side().is_some()
    }

    /// Whether an inactive rule becomes active at `value`.
    ///
    /// With a margin the value has to reach `threshold ∓ margin`.
    pub fn enters(&self, value: f64, margin: f64) -> bool {
        match self.op.low_side() {
            Some(true) if margin > 0.0 => value <= self.threshold - margin,
            Some(false) if margin > 0.0 => value >= self.threshold + margin,
            _ => self.holds(value),
        }
    }

    /// Whether an active rule becomes inactive at `value`.
    ///
    /// With a margin the value has to reach `threshold ± margin` on the
    /// other side.
    pub fn exits(&self, value: f64, margin: f64) -> bool {
        match self.op.low_side() {
            Some(true) if margin > 0.0 => value >= self.threshold + margin,
            Some(false) if margin > 0.0 => value <= self.threshold - margin,
            _ => !self.holds(value),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.as_str(), self.threshold)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_conditions() {
        // ---
        let c = Condition::parse("temperature < 0").unwrap();
        assert_eq!(c.field, "temperature");
        assert_eq!(c.op, Operator::Lt);
        assert_eq!(c.threshold, 0.0);

        let c = Condition::parse("wind_gust>=90.5").unwrap();
        assert_eq!((c.op, c.threshold), (Operator::Ge, 90.5));

        let c = Condition::parse("  humidity != -1e2 ").unwrap();
        assert_eq!((c.op, c.threshold), (Operator::Ne, -100.0));
    }

    #[test]
    fn test_parse_rejections() {
        // ---
        for expr in [
            "",
            "temperature",
            "< 0",
            "temperature < ",
            "temperature < warm",
            "temperature <> 3",
            "temperature = 3",
            "1temp < 3",
            "temp erature < 3",
            "temperature < inf",
        ] {
            assert!(
                matches!(
                    Condition::parse(expr),
                    Err(CoreError::InvalidRuleDefinition { .. })
                ),
                "expected rejection for {expr:?}"
            );
        }
    }

    #[test]
    fn test_hysteresis_levels() {
        // ---
        let freeze = Condition::parse("temperature < 0").unwrap();
        assert!(!freeze.enters(-0.5, 1.0));
        assert!(freeze.enters(-1.0, 1.0));
        assert!(!freeze.exits(0.9, 1.0));
        assert!(freeze.exits(1.0, 1.0));

        // Without a margin the plain condition applies both ways
        assert!(freeze.enters(-0.1, 0.0));
        assert!(freeze.exits(0.0, 0.0));

        let heat = Condition::parse("temperature > 30").unwrap();
        assert!(heat.enters(32.0, 2.0));
        assert!(!heat.exits(28.5, 2.0));
        assert!(heat.exits(28.0, 2.0));
    }
}
