//! Built-in Tools

use async_trait::async_trait;
use serde_json::json;

use crate::error::{AgentError, Result};
use crate::message::ToolCallRequest;
use crate::tool::{ParameterSchema, Tool, ToolContext, ToolResult, ToolSchema};

/// DateTime tool - returns current time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "datetime".into(),
            description: "Get the current date and time (UTC)".into(),
            parameters: vec![
                ParameterSchema::new("format", "string", "Output format: 'iso', 'human', or 'unix'")
                    .with_default(json!("human"))
                    .with_enum(vec![json!("iso"), json!("human"), json!("unix")]),
            ],
            category: Some("time".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolContext) -> Result<ToolResult> {
        let format = call
            .arguments
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("human");

        let now = chrono::Utc::now();

        let output = match format {
            "iso" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            _ => now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
        };

        Ok(ToolResult::success("datetime", output))
    }
}

/// Calculator tool - evaluates mathematical expressions
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "calculate".into(),
            description: "Evaluate a mathematical expression".into(),
            parameters: vec![
                ParameterSchema::new(
                    "expression",
                    "string",
                    "Mathematical expression to evaluate (e.g., '2 + 2', '(1 + 2) * 3')",
                )
                .required(),
            ],
            category: Some("math".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolContext) -> Result<ToolResult> {
        let expr = call
            .arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::ToolValidation("Missing expression".into()))?;

        evaluate_expression(expr)
            .map(|value| {
                ToolResult::success("calculate", format!("{expr} = {value}"))
                    .with_data(json!({ "value": value }))
            })
            .map_err(AgentError::ToolExecution)
    }
}

/// Recursive-descent evaluator over `+ - * / ^` and parentheses
pub fn evaluate_expression(expr: &str) -> std::result::Result<f64, String> {
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(format!("Expression longer than {MAX_EXPRESSION_LEN} characters"));
    }
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = ExprParser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.sum()?;
    if parser.pos != tokens.len() {
        return Err(format!("Unexpected '{}' at position {}", tokens[parser.pos], parser.pos));
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err("Result is not a finite number".into())
    }
}

const MAX_EXPRESSION_LEN: usize = 4096;
const MAX_NESTING: usize = 64;

struct ExprParser<'a> {
    tokens: &'a [char],
    pos: usize,
    /// Parentheses, exponents and unary signs currently open
    depth: usize,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn nested(
        &mut self,
        rule: fn(&mut Self) -> std::result::Result<f64, String>,
    ) -> std::result::Result<f64, String> {
        if self.depth >= MAX_NESTING {
            return Err("Expression nested too deeply".into());
        }
        self.depth += 1;
        let value = rule(self);
        self.depth -= 1;
        value
    }

    fn sum(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.product()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.product()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn product(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.power()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.power()?;
            if op == '/' {
                if rhs == 0.0 {
                    return Err("Division by zero".into());
                }
                value /= rhs;
            } else {
                value *= rhs;
            }
        }
        Ok(value)
    }

    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            // right associative
            let exponent = self.nested(Self::power)?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.nested(Self::unary)?)
            }
            Some('+') => {
                self.pos += 1;
                self.nested(Self::unary)
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.nested(Self::sum)?;
                if self.peek() != Some(')') {
                    return Err("Missing closing parenthesis".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.tokens[start..self.pos].iter().collect();
                literal.parse::<f64>().map_err(|e| format!("Parse error: {e}"))
            }
            Some(c) => Err(format!("Unexpected '{c}' at position {}", self.pos)),
            None => Err("Unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_calculator() {
        assert!((evaluate_expression("2 + 2").unwrap() - 4.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("10 * 5").unwrap() - 50.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("(2 + 3) * 4").unwrap() - 20.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("2 ^ 8").unwrap() - 256.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("10 - 2 - 3").unwrap() - 5.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("-3 * -2").unwrap() - 6.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("2 ^ 3 ^ 2").unwrap() - 512.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_calculator_errors() {
        assert!(evaluate_expression("1 / 0").is_err());
        assert!(evaluate_expression("(1 + 2").is_err());
        assert!(evaluate_expression("1 +").is_err());
        assert!(evaluate_expression("abc").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
        assert_eq!(evaluate_expression(&parens).unwrap_err(), "Expression nested too deeply");

        let negations = format!("{}1", "-".repeat(1000));
        assert_eq!(evaluate_expression(&negations).unwrap_err(), "Expression nested too deeply");

        let tower = vec!["2"; 1000].join("^");
        assert_eq!(evaluate_expression(&tower).unwrap_err(), "Expression nested too deeply");

        let shallow = format!("{}1{}", "(".repeat(32), ")".repeat(32));
        assert!((evaluate_expression(&shallow).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!(evaluate_expression(&"1+".repeat(5000)).is_err());
    }

    #[tokio::test]
    async fn test_calculator_tool_error_is_typed() {
        let ctx = ToolContext::new("test", 0, CancellationToken::new());
        let call = ToolCallRequest::from_value("calculate", json!({"expression": "1/0"})).unwrap();
        let err = CalculatorTool.execute(&call, &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn test_datetime_unix() {
        let ctx = ToolContext::new("test", 0, CancellationToken::new());
        let call = ToolCallRequest::from_value("datetime", json!({"format": "unix"})).unwrap();
        let result = DateTimeTool.execute(&call, &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.output.parse::<i64>().is_ok());
    }
}
