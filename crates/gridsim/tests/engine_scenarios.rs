//! End-to-end engine behaviour: scheduling, debugging, control and GOOSE
//! driven through the public `Engine` API with a manual clock.

use std::sync::Arc;

use gridsim::control::ControlResult;
use gridsim::engine::{DeviceConfig, Engine, EngineSettings, EngineState, PausePoint};
use gridsim::goose::GooseConfig;
use gridsim::substation::WriteSource;
use gridsim_types::{ManualClock, Value};

fn engine_with(settings: EngineSettings) -> (Engine, ManualClock) {
    let clock = ManualClock::new(0);
    let engine = Engine::new(settings, Arc::new(clock.clone()));
    (engine, clock)
}

fn engine() -> (Engine, ManualClock) {
    engine_with(EngineSettings::default())
}

const COUNTER: &str = "\
VAR n : INT := 0; END_VAR
n := n + 1;
Device.WriteRegister(1, n);";

#[test]
fn test_if_scenario_completes_in_one_tick() {
    let (mut engine, _clock) = engine();
    engine.add_device(DeviceConfig::new("ied1"));
    engine
        .load_script("ied1", "VAR x : INT := 0; END_VAR\nIF x = 0 THEN\n  x := 1;\nEND_IF;")
        .unwrap();
    engine.start();

    let report = engine.tick();
    assert!(report.paused_at.is_none());
    assert!(report.error.is_none());

    let device = engine.device("ied1").unwrap();
    assert_eq!(device.scope().unwrap().lookup("x"), Some(&Value::Int(1)));
    assert!(!device.is_executing());
}

#[test]
fn test_hit_count_pauses_on_nth_reach() {
    let (mut engine, clock) = engine();
    engine.add_device(DeviceConfig::new("ied1"));
    engine.load_script("ied1", COUNTER).unwrap();
    engine.set_breakpoint("ied1", 2, true, None, Some(3)).unwrap();
    engine.start();

    for _ in 0..2 {
        assert!(engine.tick().paused_at.is_none());
        clock.advance(100);
    }
    let report = engine.tick();
    assert_eq!(
        report.paused_at,
        Some(PausePoint {
            device_id: "ied1".to_string(),
            line: 2
        })
    );
    assert_eq!(engine.state(), EngineState::Paused);

    let debug = engine.debug_state().unwrap();
    let breakpoint = debug.breakpoints.iter().find(|b| b.line == 2).unwrap();
    assert_eq!(breakpoint.hits, 3);
    assert_eq!(debug.current_line, Some(2));
}

#[test]
fn test_condition_error_counts_as_false() {
    let (mut engine, _clock) = engine();
    engine.add_device(DeviceConfig::new("ied1"));
    engine.load_script("ied1", COUNTER).unwrap();
    // Division by zero while evaluating the condition
    engine
        .set_breakpoint("ied1", 2, true, Some("n / 0 = 1".to_string()), None)
        .unwrap();
    engine.start();

    assert!(engine.tick().paused_at.is_none());
    assert_eq!(engine.state(), EngineState::Running);
}

#[test]
fn test_breakpoint_stops_whole_tick() {
    let (mut engine, _clock) = engine();
    engine.add_device(DeviceConfig::new("a"));
    engine.add_device(DeviceConfig::new("b"));
    engine.load_script("a", COUNTER).unwrap();
    engine.load_script("b", COUNTER).unwrap();
    engine.set_breakpoint("a", 2, true, None, None).unwrap();
    engine.start();

    engine.tick();
    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(engine.debug_target(), Some("a"));
    assert_eq!(engine.device("b").unwrap().current_line(), None);
}

#[test]
fn test_disabling_one_device_leaves_others() {
    let (mut engine, clock) = engine_with(EngineSettings {
        statement_budget: 1,
        ..EngineSettings::default()
    });
    engine.add_device(DeviceConfig::new("a"));
    engine.add_device(DeviceConfig::new("b"));
    engine.load_script("a", COUNTER).unwrap();
    engine.load_script("b", COUNTER).unwrap();
    engine.start();

    engine.tick();
    assert_eq!(engine.device("a").unwrap().current_line(), Some(2));
    assert_eq!(engine.device("b").unwrap().current_line(), Some(2));

    engine.set_device_enabled("a", false).unwrap();
    let a = engine.device("a").unwrap();
    assert_eq!(a.current_line(), None);
    assert!(!a.is_executing());

    clock.advance(100);
    engine.tick();
    assert_eq!(engine.device("a").unwrap().current_line(), None);
    assert_eq!(engine.device("b").unwrap().current_line(), Some(3));
}

#[test]
fn test_runtime_error_stops_engine() {
    let (mut engine, _clock) = engine();
    engine.add_device(DeviceConfig::new("bad"));
    engine
        .load_script("bad", "VAR x : INT := 0; END_VAR\nx := 1 / x;")
        .unwrap();
    engine.start();

    let report = engine.tick();
    assert!(report.error.is_some());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.last_error().unwrap().starts_with("bad:"));

    engine.start();
    assert!(engine.last_error().is_none());
}

#[test]
fn test_status_only_select_is_refused() {
    let (mut engine, _clock) = engine();
    let substation = engine.substation_mut();
    substation.write_mms(
        "IED1LD0/GGIO1.SPCSO1.ctlModel",
        Value::from("status-only"),
        WriteSource::Project,
        0,
    );

    let result = substation.select_control("IED1LD0/GGIO1.SPCSO1", "client-a", 0);
    assert_eq!(
        result,
        ControlResult {
            success: false,
            error: Some("Control Model does not support Selection".to_string())
        }
    );
}

#[test]
fn test_sbo_expiry_frees_object() {
    let (mut engine, _clock) = engine();
    let path = "IED1LD0/CSWI1.Pos";
    let substation = engine.substation_mut();
    substation.write_mms(
        &format!("{path}.ctlModel"),
        Value::from("sbo-with-normal-security"),
        WriteSource::Project,
        0,
    );
    substation.write_mms(&format!("{path}.sboTimeout"), Value::Int(1_000), WriteSource::Project, 0);

    let unselected = substation.operate_control(path, Value::Bool(true), "a", 0);
    assert_eq!(unselected.error.as_deref(), Some("Object not selected"));

    assert!(substation.select_control(path, "a", 0).success);
    let expired = substation.operate_control(path, Value::Bool(true), "a", 1_500);
    assert_eq!(expired.error.as_deref(), Some("Selection expired"));

    assert!(substation.select_control(path, "b", 1_500).success);
    assert!(substation.operate_control(path, Value::Bool(true), "b", 1_600).success);
    assert_eq!(
        substation.read_mms(&format!("{path}.stVal")),
        Some(&Value::Bool(true))
    );

    // Only the successful operate is reported, once
    let report = engine.tick();
    assert_eq!(report.control_updates.len(), 1);
    assert_eq!(report.control_updates[0].client, "b");
    assert_eq!(report.control_updates[0].at_ms, 1_600);
    assert!(engine.tick().control_updates.is_empty());
}

#[test]
fn test_script_write_bursts_goose() {
    let (mut engine, clock) = engine();
    let member = "IED1LD0/XCBR1.Pos.stVal";
    {
        let substation = engine.substation_mut();
        substation.write_mms(member, Value::Int(1), WriteSource::Project, 0);
        substation.register_goose(
            "IED1LD0/LLN0.gcb01",
            GooseConfig {
                app_id: 1,
                conf_rev: 1,
                min_time: 10,
                max_time: 1_000,
                dat_set: "IED1LD0/LLN0.DS1".to_string(),
            },
            vec![member.to_string()],
            0,
        );
    }
    engine.add_device(DeviceConfig::new("ied1"));
    engine
        .load_script("ied1", &format!("Device.SetDA('{member}', 2);"))
        .unwrap();
    engine.start();

    // The script writes during this tick; the burst goes out on the next
    engine.tick();
    let publisher = engine.substation().goose().publisher("IED1LD0/LLN0.gcb01").unwrap();
    assert_eq!(publisher.st_num, 2);
    assert_eq!(publisher.sq_num, 0);

    clock.advance(100);
    let report = engine.tick();
    assert_eq!(report.frames.len(), 1);
    assert_eq!(report.frames[0].st_num, 2);
    assert_eq!(report.frames[0].data, vec![(member.to_string(), Value::Int(2))]);

    let publisher = engine.substation().goose().publisher("IED1LD0/LLN0.gcb01").unwrap();
    assert_eq!(publisher.current_interval, 10);
}
