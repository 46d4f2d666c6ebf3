//! Built-in demo workloads.

use std::time::Duration;

use anyhow::bail;
use dispatchlet::{RegistryError, Workload, WorkloadRegistry, optional, required};
use serde_json::json;

pub fn registry() -> Result<WorkloadRegistry, RegistryError> {
    let mut registry = WorkloadRegistry::new();
    registry.register("arith", arith)?;
    registry.register("text", text)?;
    registry.register("sleepy", sleepy)?;
    Ok(registry)
}

fn arith() -> anyhow::Result<Workload> {
    Ok(Workload::new("arith")
        .with_routine("double", |p| {
            let x: i64 = required(&p, "x")?;
            Ok(json!(x * 2))
        })
        .with_routine("add", |p| {
            let a: i64 = required(&p, "a")?;
            let b: i64 = required(&p, "b")?;
            Ok(json!(a + b))
        })
        .with_routine("divide", |p| {
            let a: f64 = required(&p, "a")?;
            let b: f64 = required(&p, "b")?;
            if b == 0.0 {
                bail!("division by zero");
            }
            Ok(json!(a / b))
        }))
}

fn text() -> anyhow::Result<Workload> {
    Ok(Workload::new("text")
        .with_routine("upper", |p| {
            let text: String = required(&p, "text")?;
            Ok(json!(text.to_uppercase()))
        })
        .with_routine("word_count", |p| {
            let text: String = required(&p, "text")?;
            Ok(json!(text.split_whitespace().count()))
        }))
}

/// Slow routine for exercising timeouts and queueing.
fn sleepy() -> anyhow::Result<Workload> {
    Ok(Workload::new("sleepy").with_routine("nap", |p| {
        let ms: u64 = optional(&p, "ms")?.unwrap_or(100);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!(ms))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatchlet::Params;

    fn call(workload: &str, routine: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let workload = registry().unwrap().load(workload)?;
        let routine = workload.routine(routine).expect("routine exists");
        let serde_json::Value::Object(params) = params else {
            panic!("params must be an object");
        };
        routine(params)
    }

    #[test]
    fn lists_demo_workloads() {
        let registry = registry().unwrap();
        assert_eq!(registry.names(), vec!["arith", "sleepy", "text"]);
        let arith = registry.load("arith").unwrap();
        assert_eq!(arith.routine_names(), vec!["add", "divide", "double"]);
    }

    #[test]
    fn arith_routines() {
        assert_eq!(call("arith", "double", json!({"x": 21})).unwrap(), json!(42));
        assert_eq!(call("arith", "add", json!({"a": 2, "b": 3})).unwrap(), json!(5));
        assert_eq!(call("arith", "divide", json!({"a": 7, "b": 2})).unwrap(), json!(3.5));
        let err = call("arith", "divide", json!({"a": 1, "b": 0})).unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn text_routines() {
        assert_eq!(call("text", "upper", json!({"text": "hi there"})).unwrap(), json!("HI THERE"));
        assert_eq!(
            call("text", "word_count", json!({"text": " one two  three "})).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn nap_defaults_when_ms_missing() {
        assert_eq!(call("sleepy", "nap", json!({"ms": 1})).unwrap(), json!(1));
        let workload = registry().unwrap().load("sleepy").unwrap();
        let nap = workload.routine("nap").unwrap();
        assert_eq!(nap(Params::new()).unwrap(), json!(100));
    }
}
