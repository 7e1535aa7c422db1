//! Offline stand-ins used by the demo when no API key is configured.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::Tool;
use crate::cancellation::CallContext;
use crate::translate::TranslateError;

/// Canned phrase table; anything else is echoed with a prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockTranslator;

impl MockTranslator {
    pub fn translate(input: &str) -> String {
        match input.trim().to_lowercase().as_str() {
            "hello world" => "你好，世界".to_string(),
            "good morning" => "早上好".to_string(),
            "thank you" => "谢谢".to_string(),
            _ => format!("翻译：{input}"),
        }
    }
}

#[async_trait]
impl Tool for MockTranslator {
    fn name(&self) -> &'static str {
        "mock_translator"
    }

    fn description(&self) -> &'static str {
        "A mock tool that translates text between different languages for testing purposes. \
         Input should be the text to translate."
    }

    async fn call(&self, ctx: &CallContext, input: &str) -> Result<String, TranslateError> {
        ctx.check()?;
        let result = Self::translate(input);
        debug!(input, result = %result, "mock translation");
        Ok(result)
    }
}

/// Evaluates a single binary expression `a op b`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockCalculator;

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*([-+*/])\s*(-?\d+(?:\.\d+)?)\s*$")
            .expect("valid expression regex")
    })
}

impl MockCalculator {
    pub fn evaluate(input: &str) -> Result<String, TranslateError> {
        let Some(caps) = expression_pattern().captures(input) else {
            return Ok(format!("计算结果：{input} = ?"));
        };
        let parse = |s: &str| {
            s.parse::<f64>()
                .map_err(|e| TranslateError::InvalidInput(format!("bad operand {s}: {e}")))
        };
        let lhs = parse(&caps[1])?;
        let rhs = parse(&caps[3])?;
        let value = match &caps[2] {
            "+" => lhs + rhs,
            "-" => lhs - rhs,
            "*" => lhs * rhs,
            "/" => {
                if rhs == 0.0 {
                    return Err(TranslateError::InvalidInput("division by zero".into()));
                }
                lhs / rhs
            }
            op => return Err(TranslateError::InvalidInput(format!("unsupported operator {op}"))),
        };
        Ok(format_number(value))
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[async_trait]
impl Tool for MockCalculator {
    fn name(&self) -> &'static str {
        "mock_calculator"
    }

    fn description(&self) -> &'static str {
        "A mock calculator tool that performs basic arithmetic operations for testing purposes. \
         Input should be a mathematical expression."
    }

    async fn call(&self, ctx: &CallContext, input: &str) -> Result<String, TranslateError> {
        ctx.check()?;
        let result = Self::evaluate(input)?;
        debug!(input, result = %result, "mock calculation");
        Ok(result)
    }
}
