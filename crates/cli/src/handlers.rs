use std::hint::black_box;

use offload_pool::{HandlerError, HandlerRegistry, RegistryError, TaskContext};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct SpinRequest {
    iterations: u64,
}

/// Registry with the demo handlers: `echo`, `spin` and `fail`.
pub fn demo_registry() -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", echo)?;
    registry.register_fn("spin", spin)?;
    registry.register_fn("fail", fail)?;
    Ok(registry)
}

fn echo(_ctx: &TaskContext<'_>, payload: Value) -> Result<Value, HandlerError> {
    Ok(payload)
}

/// Burn CPU for `iterations` rounds of an xorshift step.
fn spin(ctx: &TaskContext<'_>, payload: Value) -> Result<Value, HandlerError> {
    let req: SpinRequest = serde_json::from_value(payload)?;

    let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ ctx.task_id;
    for _ in 0..req.iterations {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state = black_box(state);
    }

    let mut result = json!({ "worker": ctx.worker_id, "checksum": state });
    if ctx.flags.is_enabled(offload_core::flags::EMIT_LEGACY) {
        result["iterations"] = json!(req.iterations);
    }
    Ok(result)
}

fn fail(ctx: &TaskContext<'_>, _payload: Value) -> Result<Value, HandlerError> {
    Err(HandlerError::new(format!("task {} failed on request", ctx.task_id)))
}

#[cfg(test)]
mod tests {
    use offload_pool::RuntimeFlags;

    use super::*;

    fn ctx(flags: &RuntimeFlags) -> TaskContext<'_> {
        TaskContext {
            task_id: 7,
            worker_id: 1,
            task_type: "spin",
            flags,
        }
    }

    #[test]
    fn test_registry_contents() {
        let registry = demo_registry().unwrap();
        assert_eq!(registry.task_types(), vec!["echo", "fail", "spin"]);
    }

    #[test]
    fn test_spin_is_deterministic() {
        let flags = RuntimeFlags::default();
        let a = spin(&ctx(&flags), json!({ "iterations": 1000 })).unwrap();
        let b = spin(&ctx(&flags), json!({ "iterations": 1000 })).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["iterations"], json!(1000));
        assert_eq!(a["worker"], json!(1));
    }

    #[test]
    fn test_spin_respects_legacy_flag() {
        let flags: RuntimeFlags = [("emit_legacy", false)].into_iter().collect();
        let result = spin(&ctx(&flags), json!({ "iterations": 10 })).unwrap();
        assert!(result.get("iterations").is_none());
    }

    #[test]
    fn test_spin_rejects_bad_payload() {
        let flags = RuntimeFlags::default();
        let err = spin(&ctx(&flags), json!("nope")).unwrap_err();
        assert!(err.to_string().starts_with("invalid payload"));
    }

    #[test]
    fn test_fail_reports_task() {
        let flags = RuntimeFlags::default();
        let err = fail(&ctx(&flags), Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "task 7 failed on request");
    }
}
