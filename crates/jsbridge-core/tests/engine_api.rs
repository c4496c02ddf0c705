//! End-to-end tests of the `ScriptEngine` surface over the memory runtime.
//!
//! Covers script evaluation, variables, dotted property paths, error
//! translation, precompilation and the dispatcher's ordering guarantees.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use jsbridge_core::{
    Error, ErrorCategory, HostValue, MemoryRuntimeFactory, ScriptEngine,
};

fn engine() -> ScriptEngine {
    ScriptEngine::new(MemoryRuntimeFactory::new()).expect("engine should start")
}

// =============================================================================
// Scripts and functions
// =============================================================================

#[test]
fn call_function_returns_narrowed_integer() {
    let engine = engine();
    engine.execute("function add(a, b) { return a + b; }").unwrap();

    let sum: i32 = engine
        .call_function_as("add", &[HostValue::Int(7), HostValue::Int(9)])
        .unwrap();
    assert_eq!(sum, 16);
    assert_eq!(
        engine
            .call_function("add", &[7.into(), 9.into()])
            .unwrap(),
        HostValue::Int(16)
    );
}

#[test]
fn evaluate_narrows_numbers() {
    let engine = engine();
    assert_eq!(engine.evaluate("2 + 3").unwrap(), HostValue::Int(5));
    assert_eq!(engine.evaluate("0.5").unwrap(), HostValue::Float(0.5));
    assert_eq!(engine.evaluate("0.1").unwrap(), HostValue::Double(0.1));
    assert_eq!(
        engine.evaluate("4294967296").unwrap(),
        HostValue::Long(4_294_967_296)
    );
    assert_eq!(engine.evaluate("'a' + 'b'").unwrap(), HostValue::from("ab"));
    assert_eq!(engine.evaluate("null").unwrap(), HostValue::Null);
    assert_eq!(engine.evaluate("undefined").unwrap(), HostValue::Undefined);
}

#[test]
fn script_objects_come_back_as_handles() {
    let engine = engine();
    let value = engine.evaluate("({ a: 1 })").unwrap();
    assert!(matches!(value, HostValue::Script(_)));

    // A handle can be passed back in while it is reachable.
    engine.set_variable_value("copy", value).unwrap();
    assert_eq!(engine.get_property_value("copy", "a").unwrap(), HostValue::Int(1));
}

#[test]
fn held_script_handles_survive_collection() {
    let engine = engine();
    let value = engine.evaluate("({ a: 1 })").unwrap();
    engine.collect_garbage().unwrap();
    engine.set_variable_value("y", value.clone()).unwrap();
    assert_eq!(engine.get_property_value("y", "a").unwrap(), HostValue::Int(1));

    // Once the host lets go, the script's own reference keeps it alive.
    drop(value);
    engine.collect_garbage().unwrap();
    assert_eq!(engine.get_property_value("y", "a").unwrap(), HostValue::Int(1));
}

#[test]
fn held_handles_outlive_automatic_collections() {
    let engine = engine();
    let held: Vec<HostValue> = (0..50)
        .map(|n| engine.evaluate(&format!("({{ n: {n} }})")).unwrap())
        .collect();
    for _ in 0..100 {
        engine
            .execute("for (var i = 0; i < 100; i++) { var junk = [i]; }")
            .unwrap();
    }
    for (n, value) in (0..50).zip(held) {
        engine.set_variable_value("h", value).unwrap();
        assert_eq!(engine.get_property_value("h", "n").unwrap(), HostValue::Int(n));
    }
}

#[test]
fn handles_from_another_engine_are_rejected() {
    let first = engine();
    let second = engine();
    let value = first.evaluate("({})").unwrap();
    let err = second.set_variable_value("x", value).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Usage);
    assert!(!second.has_variable("x").unwrap());
}

#[test]
fn functions_see_the_global_object_as_this() {
    let engine = engine();
    engine
        .execute("var label = 'global'; function who() { return this.label; }")
        .unwrap();
    assert_eq!(
        engine.call_function_as::<String>("who", &[]).unwrap(),
        "global"
    );
}

#[test]
fn typed_extraction_mismatch_is_usage() {
    let engine = engine();
    let err = engine.evaluate_as::<i32>("'text'").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Usage);
}

// =============================================================================
// Variables
// =============================================================================

#[test]
fn undefined_variable_is_treated_as_absent() {
    let engine = engine();
    engine.set_variable_value("x", HostValue::Undefined).unwrap();
    assert!(!engine.has_variable("x").unwrap());
    assert_eq!(engine.get_variable_value("x").unwrap(), HostValue::Undefined);

    engine.set_variable_value("x", HostValue::Null).unwrap();
    assert!(engine.has_variable("x").unwrap());
}

#[test]
fn missing_variable_fails_but_undefined_one_reads() {
    let engine = engine();
    let err = engine.get_variable_value("neverDeclared").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    assert!(err.to_string().contains("'neverDeclared'"), "{err}");
    assert!(engine.get_variable_value_as::<Option<i32>>("neverDeclared").is_err());

    engine.execute("var declared;").unwrap();
    assert!(!engine.has_variable("declared").unwrap());
    assert_eq!(
        engine.get_variable_value("declared").unwrap(),
        HostValue::Undefined
    );
}

#[test]
fn script_and_host_share_globals() {
    let engine = engine();
    engine.set_variable_value("limit", 10).unwrap();
    engine.execute("var doubled = limit * 2;").unwrap();
    assert_eq!(engine.get_variable_value_as::<i64>("doubled").unwrap(), 20);
}

// =============================================================================
// Property paths
// =============================================================================

#[test]
fn set_property_auto_vivifies_root_and_intermediates() {
    let engine = engine();
    assert!(!engine.has_variable("shop").unwrap());

    engine
        .set_property_value("shop", "products.headphones.price", 120.55)
        .unwrap();

    assert!(engine.has_variable("shop").unwrap());
    assert!(engine.has_property("shop", "products.headphones.price").unwrap());
    let price: f64 = engine
        .get_property_value_as("shop", "products.headphones.price")
        .unwrap();
    assert!((price - 120.55).abs() < 1e-9);
    assert_eq!(
        engine.evaluate("shop.products.headphones.price").unwrap(),
        HostValue::Double(120.55)
    );
}

#[test]
fn missing_intermediate_names_root_and_prefix() {
    let engine = engine();
    engine
        .set_property_value("shop", "products.headphones.price", 120.55)
        .unwrap();

    assert!(!engine.has_property("shop", "products.missing.price").unwrap());
    let err = engine
        .get_property_value("shop", "products.missing.price")
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    let message = err.to_string();
    assert!(message.contains("'shop'"), "{message}");
    assert!(message.contains("'products.missing'"), "{message}");
    assert!(message.contains("does not exist"), "{message}");
}

#[test]
fn missing_root_fails_get_but_not_has() {
    let engine = engine();
    assert!(!engine.has_property("nowhere", "a").unwrap());
    let err = engine.get_property_value("nowhere", "a").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    assert!(engine.remove_property("nowhere", "a").is_err());
}

#[test]
fn remove_property_deletes_final_segment_only() {
    let engine = engine();
    engine.set_property_value("cfg", "net.port", 8080).unwrap();
    engine.set_property_value("cfg", "net.host", "localhost").unwrap();

    engine.remove_property("cfg", "net.port").unwrap();
    assert!(!engine.has_property("cfg", "net.port").unwrap());
    assert!(engine.has_property("cfg", "net.host").unwrap());
    // Removing an already missing leaf is a no-op.
    engine.remove_property("cfg", "net.port").unwrap();
}

#[test]
fn property_holding_undefined_is_absent() {
    let engine = engine();
    engine.execute("var box = { empty: undefined, zero: 0 };").unwrap();
    assert!(!engine.has_property("box", "empty").unwrap());
    assert!(engine.has_property("box", "zero").unwrap());
    assert_eq!(
        engine.get_property_value("box", "empty").unwrap(),
        HostValue::Undefined
    );
}

// =============================================================================
// Error translation
// =============================================================================

#[test]
fn syntax_errors_are_compilation_errors_with_location() {
    let engine = engine();
    let err = engine
        .execute_with_name("var ok = 1;\nvar broken = ;", "broken.js")
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Compilation);
    let record = err.record().unwrap();
    assert_eq!(record.document_name, "broken.js");
    assert_eq!(record.line, 2);
    assert!(record.column > 0);
    assert!(err.is_recoverable());
    assert!(err.remediation().is_some());
}

#[test]
fn thrown_errors_carry_message_and_call_stack() {
    let engine = engine();
    engine
        .execute_with_name(
            "function inner() { throw new TypeError('bad input'); }\nfunction outer() { inner(); }",
            "calc.js",
        )
        .unwrap();

    let err = engine.call_function("outer", &[]).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    let record = err.record().unwrap();
    assert_eq!(record.error_type, "TypeError");
    assert_eq!(record.description, "bad input");
    assert!(record.message.ends_with(": bad input"), "{}", record.message);
    assert!(record.frames.len() >= 2, "{:?}", record.frames);
    assert_eq!(record.frames[0].function_name, "inner");
    assert_eq!(record.frames[0].document_name, "calc.js");
    assert!(record.call_stack.contains("at outer (calc.js:2:"));
    assert_eq!(record.document_name, "calc.js");
    assert_eq!(record.line, 1);

    // The engine stays usable.
    assert_eq!(engine.evaluate("1 + 1").unwrap(), HostValue::Int(2));
}

#[test]
fn thrown_primitives_use_their_string_form() {
    let engine = engine();
    let err = engine.execute("throw 'plain';").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    assert_eq!(err.record().unwrap().description, "plain");
}

#[test]
fn error_records_serialize() {
    let engine = engine();
    let err = engine.execute("missingFunction();").unwrap_err();
    let record = err.record().unwrap();
    assert_eq!(record.error_type, "ReferenceError");
    let json = serde_json::to_string(record).unwrap();
    assert!(json.contains("ReferenceError"));
}

// =============================================================================
// Precompilation
// =============================================================================

#[test]
fn precompiled_script_runs_repeatedly() {
    let engine = engine();
    engine.set_variable_value("runs", 0).unwrap();
    let script = engine
        .precompile_with_name("runs = runs + 1;", "counter.js")
        .unwrap();
    assert_eq!(script.document_name(), "counter.js");
    assert!(!script.cached_data().is_empty());

    engine.execute_precompiled(&script).unwrap();
    engine.execute_precompiled(&script).unwrap();
    assert_eq!(engine.get_variable_value("runs").unwrap(), HostValue::Int(2));
}

#[test]
fn precompile_reports_syntax_errors() {
    let engine = engine();
    let err = engine.precompile("function (").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Compilation);
}

// =============================================================================
// Dispatcher behavior
// =============================================================================

#[test]
fn concurrent_callers_are_serialized() {
    let engine = Arc::new(engine());
    engine.set_variable_value("counter", 0).unwrap();
    engine
        .execute("function bump() { var before = counter; counter = before + 1; return before; }")
        .unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..50)
                    .map(|_| engine.call_function_as::<i32>("bump", &[]).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen: Vec<i32> = threads
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
    assert_eq!(engine.get_variable_value("counter").unwrap(), HostValue::Int(200));
}

#[test]
fn interrupt_aborts_a_running_script() {
    let engine = engine();
    let done = AtomicBool::new(false);

    let result = thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.interrupt().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });
        let result = engine.execute("while (true) {}");
        done.store(true, Ordering::Release);
        result
    });

    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Interrupted);
    assert!(err.is_recoverable());
    assert_eq!(engine.evaluate("40 + 2").unwrap(), HostValue::Int(42));
}

#[test]
fn deep_recursion_is_a_runtime_error() {
    let engine = engine();
    engine
        .execute("function down(n) { return down(n + 1); }")
        .unwrap();
    let err = engine.call_function("down", &[0.into()]).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Runtime);
    assert_eq!(err.record().unwrap().error_type, "RangeError");
}

#[test]
fn deeply_nested_scripts_fail_to_compile() {
    let engine = engine();
    let parens = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
    let err = engine.evaluate(&parens).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Compilation);

    let negations = format!("{}true", "!".repeat(200_000));
    assert_eq!(
        engine.evaluate(&negations).unwrap_err().category(),
        ErrorCategory::Compilation
    );
    let sum = vec!["1"; 200_000].join(" + ");
    assert_eq!(
        engine.evaluate(&sum).unwrap_err().category(),
        ErrorCategory::Compilation
    );
    assert_eq!(engine.evaluate("((((1 + 2))))").unwrap(), HostValue::Int(3));
}

#[test]
fn dispose_is_idempotent_and_rejects_calls() {
    let engine = engine();
    engine.execute("var x = 1;").unwrap();
    engine.dispose();
    engine.dispose();
    assert!(matches!(engine.get_variable_value("x"), Err(Error::Disposed)));
    assert!(matches!(engine.execute("x"), Err(Error::Disposed)));
    drop(engine);
}
