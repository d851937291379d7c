//! Integration tests for opaque host handles
//!
//! Ref counts must follow the interpreter's collector: every marker a script
//! can reach holds one count, and collection gives it back.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use luabridge::{BridgeConfig, HostError, LuaRuntime, OpaqueRef, PropertyAccess, ScriptValue};

fn runtime() -> LuaRuntime {
    LuaRuntime::new().expect("runtime")
}

fn track_finalized(rt: &LuaRuntime) -> Rc<RefCell<Vec<i32>>> {
    let finalized = Rc::new(RefCell::new(Vec::new()));
    let sink = finalized.clone();
    rt.set_handle_finalizer(move |id| sink.borrow_mut().push(id));
    finalized
}

/// Property store shared by the getter and setter
fn install_properties(rt: &LuaRuntime) -> Rc<RefCell<HashMap<(i32, String), ScriptValue>>> {
    let store: Rc<RefCell<HashMap<(i32, String), ScriptValue>>> = Rc::new(RefCell::new(HashMap::new()));
    let reader = store.clone();
    let writer = store.clone();
    rt.set_property_handlers(
        move |id, key| {
            if key == "broken" {
                return Err(HostError::new("sensor offline"));
            }
            Ok(match reader.borrow().get(&(id, key.to_string())) {
                Some(ScriptValue::Int(i)) => ScriptValue::Int(*i),
                Some(ScriptValue::Bytes(b)) => ScriptValue::Bytes(b.clone()),
                _ => ScriptValue::Nil,
            })
        },
        move |id, key, value| {
            if key == "broken" {
                return Err(HostError::new("sensor offline"));
            }
            writer.borrow_mut().insert((id, key.to_string()), value);
            Ok(())
        },
    );
    store
}

#[test]
fn test_refcount_invariant() {
    let rt = runtime();
    let finalized = track_finalized(&rt);

    assert_eq!(rt.increment_ref_count(5), 1);
    assert_eq!(rt.increment_ref_count(5), 2);

    rt.decrement_ref_count(5);
    assert!(finalized.borrow().is_empty());
    assert_eq!(rt.ref_count(5), Some(1));

    rt.decrement_ref_count(5);
    assert_eq!(*finalized.borrow(), vec![5]);
    assert_eq!(rt.ref_count(5), None);

    rt.decrement_ref_count(5);
    assert_eq!(*finalized.borrow(), vec![5]);
}

#[test]
fn test_unknown_handle_decrement_is_noop() {
    let rt = runtime();
    let finalized = track_finalized(&rt);
    rt.decrement_ref_count(1234);
    assert!(finalized.borrow().is_empty());
}

#[test]
fn test_create_handle_global_counts_reference() {
    let rt = runtime();
    rt.create_handle_global("widget", 11).unwrap();
    assert_eq!(rt.ref_count(11), Some(1));

    let values = rt.execute("return widget, type(widget), tostring(widget)").unwrap();
    assert_eq!(values[0], ScriptValue::OpaqueRef(OpaqueRef::host(11)));
    assert_eq!(values[1], ScriptValue::from("userdata"));
    assert_eq!(values[2], ScriptValue::from("handle: 11"));

    // Lifting a marker does not take a count
    assert_eq!(rt.ref_count(11), Some(1));
}

#[test]
fn test_unreachable_handle_is_finalized() {
    let rt = runtime();
    let finalized = track_finalized(&rt);

    rt.create_handle_global("temp", 3).unwrap();
    rt.execute("temp = nil").unwrap();
    rt.collect_garbage().unwrap();

    assert_eq!(*finalized.borrow(), vec![3]);
    assert_eq!(rt.ref_count(3), None);
}

#[test]
fn test_multiple_handles_independence() {
    let rt = runtime();
    let finalized = track_finalized(&rt);

    rt.create_handle_global("A", 1).unwrap();
    rt.create_handle_global("B", 2).unwrap();
    rt.create_handle_global("C", 3).unwrap();

    rt.execute("B = nil").unwrap();
    rt.collect_garbage().unwrap();

    assert_eq!(*finalized.borrow(), vec![2]);
    assert_eq!(rt.ref_count(1), Some(1));
    assert_eq!(rt.ref_count(3), Some(1));

    let values = rt.execute("return A, C").unwrap();
    assert_eq!(
        values,
        vec![ScriptValue::OpaqueRef(OpaqueRef::host(1)), ScriptValue::OpaqueRef(OpaqueRef::host(3))]
    );
}

#[test]
fn test_each_marker_holds_a_count() {
    let rt = runtime();
    let finalized = track_finalized(&rt);

    // A handle passed back into the interpreter gets a second marker
    rt.create_handle_global("first", 8).unwrap();
    let handle = rt.get_global("first").unwrap();
    rt.set_global("second", &handle).unwrap();
    assert_eq!(rt.ref_count(8), Some(2));

    rt.execute("first = nil").unwrap();
    rt.collect_garbage().unwrap();
    assert!(finalized.borrow().is_empty());
    assert_eq!(rt.ref_count(8), Some(1));

    rt.execute("second = nil").unwrap();
    rt.collect_garbage().unwrap();
    assert_eq!(*finalized.borrow(), vec![8]);
}

#[test]
fn test_host_functions_receive_and_return_handles() {
    let rt = runtime();
    rt.register_function("open", |args| {
        let id = args.first().and_then(ScriptValue::as_int).unwrap_or(0) as i32;
        Ok(ScriptValue::OpaqueRef(OpaqueRef::host(id)))
    })
    .unwrap();
    rt.register_function("handle_id", |args| match args.first() {
        Some(ScriptValue::OpaqueRef(opaque)) => Ok(ScriptValue::Int(i64::from(opaque.handle_id()))),
        _ => Err("expected a handle".into()),
    })
    .unwrap();

    let values = rt.execute("local h = open(21); return handle_id(h)").unwrap();
    assert_eq!(values, vec![ScriptValue::Int(21)]);
}

#[test]
fn test_teardown_finalizes_remaining_handles() {
    let finalized = Rc::new(RefCell::new(Vec::new()));
    {
        let rt = runtime();
        let sink = finalized.clone();
        rt.set_handle_finalizer(move |id| sink.borrow_mut().push(id));
        rt.create_handle_global("kept", 77).unwrap();
    }
    assert_eq!(*finalized.borrow(), vec![77]);
}

#[test]
fn test_teardown_without_finalizer() {
    let rt = runtime();
    rt.create_handle_global("kept", 1).unwrap();
    rt.create_proxy_handle_global("proxy", 2).unwrap();
    drop(rt);
}

#[test]
fn test_opaque_handle_rejects_indexing() {
    let rt = runtime();
    rt.create_handle_global("opaque", 4).unwrap();

    let err = rt.execute("return opaque.name").unwrap_err().to_string();
    assert!(err.contains("opaque handle 4"), "{err}");

    let err = rt.execute("opaque.name = 1").unwrap_err().to_string();
    assert!(err.contains("opaque handle 4"), "{err}");
}

#[test]
fn test_proxy_property_access() {
    let rt = runtime();
    let store = install_properties(&rt);
    rt.create_proxy_handle_global("sensor", 9).unwrap();

    rt.execute("sensor.label = 'boiler'; sensor.reading = 451").unwrap();
    assert_eq!(store.borrow().get(&(9, "label".to_string())), Some(&ScriptValue::from("boiler")));

    let values = rt.execute("return sensor.label, sensor.reading, sensor.unset, sensor[true]").unwrap();
    assert_eq!(
        values,
        vec![ScriptValue::from("boiler"), ScriptValue::Int(451), ScriptValue::Nil, ScriptValue::Nil]
    );

    assert_eq!(rt.execute("return tostring(sensor)").unwrap(), vec![ScriptValue::from("proxy handle: 9")]);
    assert_eq!(
        rt.execute("return sensor").unwrap(),
        vec![ScriptValue::OpaqueRef(OpaqueRef::proxy(9))]
    );
}

#[test]
fn test_proxy_getter_error_carries_key() {
    let rt = runtime();
    install_properties(&rt);
    rt.create_proxy_handle_global("sensor", 9).unwrap();

    let err = rt.execute("return sensor.broken").unwrap_err().to_string();
    assert!(err.contains("broken"), "{err}");
    assert!(err.contains("sensor offline"), "{err}");

    let values = rt
        .execute("local ok, err = pcall(function() return sensor.broken end); return ok, err")
        .unwrap();
    assert_eq!(values[0], ScriptValue::Bool(false));
    assert!(values[1].as_str().unwrap_or_default().contains("sensor offline"));
}

#[test]
fn test_marker_errors_are_plain_strings() {
    let rt = runtime();
    install_properties(&rt);
    rt.create_proxy_handle_global("sensor", 9).unwrap();
    rt.create_proxy_handle_global_with_access("gauge", 1, PropertyAccess::NONE).unwrap();
    rt.create_handle_global("opaque", 4).unwrap();
    rt.register_function("fail", |_| Err(HostError::new("sensor offline"))).unwrap();

    let test_cases = vec![
        ("return sensor.broken", "sensor offline"),
        ("sensor.broken = 1", "sensor offline"),
        ("return gauge.level", "is not readable"),
        ("gauge.level = 1", "is not writable"),
        ("return opaque.name", "opaque handle 4"),
        ("opaque.name = 1", "opaque handle 4"),
        ("return fail()", "sensor offline"),
    ];

    for (body, expected) in test_cases {
        let script = format!(
            r#"
            local ok, err = pcall(function() {body} end)
            return ok, type(err), string.find(err, '{expected}', 1, true) ~= nil, 'caught: ' .. err
            "#
        );
        let values = rt.execute(&script).unwrap();
        assert_eq!(values[0], ScriptValue::Bool(false), "script: {body}");
        assert_eq!(values[1], ScriptValue::from("string"), "script: {body}");
        assert_eq!(values[2], ScriptValue::Bool(true), "script: {body}");
        assert!(values[3].as_str().unwrap_or_default().starts_with("caught: "), "script: {body}");
    }
}

#[test]
fn test_failed_marker_allocation_is_not_finalized() {
    let config = BridgeConfig::default().with_memory_limit(256 * 1024);
    let rt = LuaRuntime::with_config(config).unwrap();
    let finalized = track_finalized(&rt);

    // Marker metatable and the target global exist before the heap fills up
    rt.create_handle_global("slot", 1).unwrap();
    rt.execute("hog = {}").unwrap();
    rt.execute(
        "pcall(function() while true do hog[#hog + 1] = string.rep('x', 512) .. #hog end end)",
    )
    .unwrap();

    let mut failed = Vec::new();
    for id in 1000..1200 {
        if rt.create_handle_global("slot", id).is_err() {
            failed.push(id);
        }
    }
    assert!(!failed.is_empty());
    for id in &failed {
        assert!(!finalized.borrow().contains(id), "handle {id} finalized after failed creation");
        assert_eq!(rt.ref_count(*id), None);
    }

    // Assigning an existing global needs no allocation
    rt.set_global("hog", &ScriptValue::Nil).unwrap();
    rt.collect_garbage().unwrap();
    rt.create_handle_global("slot", 2000).unwrap();
    assert_eq!(rt.ref_count(2000), Some(1));
    for id in &failed {
        assert!(!finalized.borrow().contains(id), "handle {id} finalized after failed creation");
    }
}

#[test]
fn test_proxy_access_control() {
    let rt = runtime();
    install_properties(&rt);

    rt.create_proxy_handle_global_with_access("gauge", 1, PropertyAccess::READ_ONLY).unwrap();
    assert!(rt.execute("return gauge.level").is_ok());
    let err = rt.execute("gauge.level = 3").unwrap_err().to_string();
    assert!(err.contains("not writable"), "{err}");

    rt.create_proxy_handle_global_with_access("valve", 2, PropertyAccess::WRITE_ONLY).unwrap();
    assert!(rt.execute("valve.open = true").is_ok());
    let err = rt.execute("return valve.open").unwrap_err().to_string();
    assert!(err.contains("not readable"), "{err}");

    rt.create_handle_global("sealed", 3).unwrap();
    assert!(rt.execute("return sealed.x").is_err());
    assert!(rt.execute("sealed.x = 1").is_err());

    rt.set_property_access(1, PropertyAccess::READ_WRITE);
    assert!(rt.execute("gauge.level = 3").is_ok());
}

#[test]
fn test_proxy_without_handlers() {
    let rt = runtime();
    rt.create_proxy_handle_global("bare", 5).unwrap();

    let err = rt.execute("return bare.x").unwrap_err().to_string();
    assert!(err.contains("not readable"), "{err}");
    let err = rt.execute("bare.x = 1").unwrap_err().to_string();
    assert!(err.contains("not writable"), "{err}");
}

#[test]
fn test_foreign_values_keep_identity() {
    let config = BridgeConfig::default().with_libraries(["base", "io"]);
    let rt = LuaRuntime::with_config(config).unwrap();

    let mut values = rt.execute("return io.stdout").unwrap();
    let stdout = values.remove(0);
    let opaque = stdout.as_opaque().expect("opaque");
    assert!(opaque.is_foreign());
    assert_eq!(opaque.handle_id(), OpaqueRef::FOREIGN_HANDLE);
    assert!(!opaque.is_proxy());

    rt.set_global("again", &stdout).unwrap();
    assert_eq!(rt.execute("return rawequal(again, io.stdout)").unwrap(), vec![ScriptValue::Bool(true)]);

    rt.release(stdout).unwrap();
    assert_eq!(rt.execute("return rawequal(again, io.stdout)").unwrap(), vec![ScriptValue::Bool(true)]);
}
