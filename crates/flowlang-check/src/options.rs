//! `with` clause option validation.
//!
//! Recognized keys, their expected literal shapes, and the consistency
//! warnings (`delay` without `retry`, `cache_backend` without `cache`, …).
//! Fallback expressions are checked against the module's output type.

use flowlang_core::dag::{Backoff, OnError, Priority, Rate};
use flowlang_core::types::DataType;
use flowlang_parser::ast::{CallOption, ExprKind, Literal};

use crate::checker::Checker;
use crate::diagnostics::{CheckError, CheckWarning};
use crate::typed::TypedOptions;

impl<'a> Checker<'a> {
    /// Resolves and validates a call's option clause. `output_ty` is the
    /// call's value type, which a fallback must be a subtype of.
    pub(crate) fn resolve_options(
        &mut self,
        options: &[CallOption],
        output_ty: &DataType,
    ) -> TypedOptions {
        let mut resolved = TypedOptions::default();
        let mut seen: Vec<&str> = Vec::new();

        for option in options {
            if seen.contains(&option.key.as_str()) {
                self.error(CheckError::InvalidOption {
                    key: option.key.clone(),
                    message: "option given more than once".into(),
                    span: option.span,
                });
                continue;
            }
            seen.push(&option.key);

            match option.key.as_str() {
                "retry" => match literal_int(option) {
                    Some(value) if value >= 0 => resolved.retry = Some(value as u32),
                    Some(_) => self.invalid(option, "must be non-negative"),
                    None => self.invalid(option, "expects a non-negative integer"),
                },
                "timeout" => match literal_duration(option) {
                    Some(duration) => resolved.timeout = Some(duration),
                    None => self.invalid(option, "expects a duration like 5s"),
                },
                "delay" => match literal_duration(option) {
                    Some(duration) => resolved.delay = Some(duration),
                    None => self.invalid(option, "expects a duration like 250ms"),
                },
                "backoff" => match ident(option) {
                    Some("fixed") => resolved.backoff = Some(Backoff::Fixed),
                    Some("linear") => resolved.backoff = Some(Backoff::Linear),
                    Some("exponential") => resolved.backoff = Some(Backoff::Exponential),
                    _ => self.invalid(option, "expects fixed, linear, or exponential"),
                },
                "fallback" => {
                    let typed = self.check(&option.value, output_ty);
                    resolved.fallback = Some(Box::new(typed));
                }
                "cache" => match literal_duration(option) {
                    Some(duration) => resolved.cache = Some(duration),
                    None => self.invalid(option, "expects a TTL duration"),
                },
                "cache_backend" => match literal_str(option) {
                    Some(name) => resolved.cache_backend = Some(name),
                    None => self.invalid(option, "expects a backend name string"),
                },
                "throttle" => match literal_rate(option) {
                    Some(rate) if rate.count > 0 => resolved.throttle = Some(rate),
                    Some(_) => self.invalid(option, "rate count must be positive"),
                    None => self.invalid(option, "expects a rate like 10/1s"),
                },
                "concurrency" => match literal_int(option) {
                    Some(value) if value > 0 => resolved.concurrency = Some(value as u32),
                    Some(_) => self.invalid(option, "must be positive"),
                    None => self.invalid(option, "expects a positive integer"),
                },
                "on_error" => match ident(option) {
                    Some("propagate") => resolved.on_error = OnError::Propagate,
                    Some("skip") => resolved.on_error = OnError::Skip,
                    Some("log") => resolved.on_error = OnError::Log,
                    Some("wrap") => resolved.on_error = OnError::Wrap,
                    _ => self.invalid(option, "expects propagate, skip, log, or wrap"),
                },
                "lazy" => match literal_bool(option) {
                    Some(value) => resolved.lazy = value,
                    None => self.invalid(option, "expects true or false"),
                },
                "priority" => match ident(option) {
                    Some("critical") => resolved.priority = Priority::Critical,
                    Some("high") => resolved.priority = Priority::High,
                    Some("normal") => resolved.priority = Priority::Normal,
                    Some("low") => resolved.priority = Priority::Low,
                    Some("background") => resolved.priority = Priority::Background,
                    _ => match literal_int(option) {
                        Some(value) => {
                            resolved.priority = Priority::Custom(value as i32);
                        }
                        None => self.invalid(
                            option,
                            "expects critical, high, normal, low, background, or an integer",
                        ),
                    },
                },
                _ => {
                    self.error(CheckError::InvalidOption {
                        key: option.key.clone(),
                        message: "unrecognized option".into(),
                        span: option.span,
                    });
                }
            }
        }

        // The zero value backs skip/log; a type without one cannot use them.
        if matches!(resolved.on_error, OnError::Skip | OnError::Log)
            && flowlang_core::value::Value::zero_of(output_ty).is_err()
        {
            if let Some(option) = options.iter().find(|o| o.key == "on_error") {
                self.error(CheckError::InvalidOption {
                    key: "on_error".into(),
                    message: format!("{output_ty} has no zero value for skip/log"),
                    span: option.span,
                });
            }
        }

        if resolved.retry.is_none() {
            if let Some(option) = options.iter().find(|o| o.key == "delay") {
                self.warnings
                    .push(CheckWarning::DelayWithoutRetry { span: option.span });
            }
            if let Some(option) = options.iter().find(|o| o.key == "backoff") {
                self.warnings
                    .push(CheckWarning::BackoffWithoutRetry { span: option.span });
            }
        }
        if resolved.cache.is_none() {
            if let Some(option) = options.iter().find(|o| o.key == "cache_backend") {
                self.warnings
                    .push(CheckWarning::CacheBackendWithoutCache { span: option.span });
            }
        }

        resolved
    }

    fn invalid(&mut self, option: &CallOption, message: &str) {
        self.error(CheckError::InvalidOption {
            key: option.key.clone(),
            message: message.into(),
            span: option.span,
        });
    }
}

fn literal_int(option: &CallOption) -> Option<i64> {
    match &option.value.kind {
        ExprKind::Literal(Literal::Int(i)) => Some(*i),
        _ => None,
    }
}

fn literal_duration(option: &CallOption) -> Option<std::time::Duration> {
    match &option.value.kind {
        ExprKind::Literal(Literal::Duration(d)) => Some(*d),
        _ => None,
    }
}

fn literal_str(option: &CallOption) -> Option<String> {
    match &option.value.kind {
        ExprKind::Literal(Literal::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn literal_bool(option: &CallOption) -> Option<bool> {
    match &option.value.kind {
        ExprKind::Literal(Literal::Bool(b)) => Some(*b),
        _ => None,
    }
}

fn literal_rate(option: &CallOption) -> Option<Rate> {
    match &option.value.kind {
        ExprKind::Literal(Literal::Rate { count, per }) => Some(Rate {
            count: *count,
            per: *per,
        }),
        _ => None,
    }
}

fn ident(option: &CallOption) -> Option<&str> {
    match &option.value.kind {
        ExprKind::Var(name) => Some(name.as_str()),
        _ => None,
    }
}
