use devmapper_core::error::{DevmapperError, DevmapperResult};
use devmapper_core::{
    CryptKeyError, CryptSpec, DeviceMapper, DevmapperTable, DevmapperTask, DevmapperTaskFactory,
    DmOp, SecureBytes, TargetRow, TaskStep,
};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

const KEY_HEX: &str = "8899aabbccddeeff00112233445566778899aabbccddeeff0011223344556677";

#[test]
fn setup_then_get_table_returns_the_same_row() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    let mapper = DeviceMapper::new(kernel.clone());
    let key = SecureBytes::hex_decode(KEY_HEX.as_bytes()).unwrap();
    let params = DevmapperTable::crypt_create_parameters(
        "aes-xts-plain64",
        &key,
        0,
        Path::new("/dev/sda3"),
        0,
        true,
    );
    let table = DevmapperTable::new(0, 2048, "crypt", params);

    mapper.setup("foo", &table)?;
    assert_eq!(mapper.get_table("foo")?, table);
    assert_eq!(mapper.get_crypt_key("foo")?, key);

    assert_eq!(
        kernel.calls(),
        vec![
            "create_task create",
            "set_name create foo",
            "add_target create 0 2048 crypt",
            "run create udev_sync=true",
            "create_task table",
            "set_name table foo",
            "run table udev_sync=false",
            "next_target table",
            "create_task table",
            "set_name table foo",
            "run table udev_sync=false",
            "next_target table",
        ]
    );
    Ok(())
}

#[test]
fn get_table_reads_only_the_first_row() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    kernel.seed("vg-lv", &[(0, 100, "linear"), (100, 50, "linear")]);
    let mapper = DeviceMapper::new(kernel.clone());

    let table = mapper.get_table("vg-lv")?;
    assert_eq!(table.start(), 0);
    assert_eq!(table.size(), 100);
    assert_eq!(
        kernel
            .calls()
            .iter()
            .filter(|call| call.starts_with("next_target"))
            .count(),
        1
    );
    Ok(())
}

#[test]
fn get_table_on_empty_device_reports_missing_table() {
    let kernel = FakeKernel::default();
    kernel.seed("bare", &[]);
    let mapper = DeviceMapper::new(kernel);

    match mapper.get_table("bare").unwrap_err() {
        DevmapperError::MissingTable(name) => assert_eq!(name, "bare"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn wipe_table_replaces_every_row_with_one_error_target() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    kernel.seed("cryptdev", &[(0, 100, "crypt"), (100, 50, "crypt")]);
    let mapper = DeviceMapper::new(kernel.clone());

    mapper.wipe_table("cryptdev")?;

    let reload_targets: Vec<String> = kernel
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("add_target reload"))
        .collect();
    assert_eq!(reload_targets, vec!["add_target reload 0 150 error"]);
    assert!(kernel
        .calls()
        .contains(&"run reload udev_sync=false".to_string()));

    let rows = kernel.rows("cryptdev");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].target_type, "error");
    assert!(rows[0].parameters.is_empty());

    match mapper.get_crypt_key("cryptdev").unwrap_err() {
        DevmapperError::CryptKey(CryptKeyError::NotCrypt) => {}
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn wipe_table_uses_the_furthest_extent() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    kernel.seed("sparse", &[(500, 20, "linear"), (0, 100, "linear"), (100, 50, "zero")]);
    let mapper = DeviceMapper::new(kernel.clone());

    mapper.wipe_table("sparse")?;
    assert_eq!(kernel.rows("sparse")[0].size, 520);
    Ok(())
}

#[test]
fn wipe_table_query_failure_never_reloads() {
    let kernel = FakeKernel::default();
    kernel.seed("dev", &[(0, 10, "linear")]);
    kernel.fail_at(DmOp::Table, TaskStep::Run);
    let mapper = DeviceMapper::new(kernel.clone());

    match mapper.wipe_table("dev").unwrap_err() {
        DevmapperError::Task { op, step, name, .. } => {
            assert_eq!(op, DmOp::Table);
            assert_eq!(step, TaskStep::Run);
            assert_eq!(name, "dev");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!kernel.calls().iter().any(|call| call.contains("reload")));
    assert_eq!(kernel.rows("dev")[0].target_type, "linear");
}

#[test]
fn wipe_table_reload_failure_keeps_the_old_rows() {
    for step in [
        TaskStep::Create,
        TaskStep::SetName,
        TaskStep::AddTarget,
        TaskStep::Run,
    ] {
        let kernel = FakeKernel::default();
        kernel.seed("dev", &[(0, 100, "crypt"), (100, 50, "linear")]);
        let before = kernel.rows("dev");
        kernel.fail_at(DmOp::Reload, step);
        let mapper = DeviceMapper::new(kernel.clone());

        match mapper.wipe_table("dev").unwrap_err() {
            DevmapperError::Task {
                op,
                step: failed,
                name,
                ..
            } => {
                assert_eq!(op, DmOp::Reload);
                assert_eq!(failed, step);
                assert_eq!(name, "dev");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(kernel.rows("dev"), before);
        assert_eq!(kernel.rows("dev")[0].target_type, "crypt");
    }
}

#[test]
fn wipe_table_row_iteration_failure_never_reloads() {
    let kernel = FakeKernel::default();
    kernel.seed("dev", &[(0, 10, "crypt")]);
    let before = kernel.rows("dev");
    kernel.fail_at(DmOp::Table, TaskStep::NextTarget);
    let mapper = DeviceMapper::new(kernel.clone());

    assert!(matches!(
        mapper.wipe_table("dev").unwrap_err(),
        DevmapperError::Task {
            op: DmOp::Table,
            step: TaskStep::NextTarget,
            ..
        }
    ));
    assert!(!kernel.calls().iter().any(|call| call.contains("reload")));
    assert_eq!(kernel.rows("dev"), before);
}

#[test]
fn get_table_row_iteration_failure_is_reported() {
    let kernel = FakeKernel::default();
    kernel.seed("dev", &[(0, 10, "linear")]);
    kernel.fail_at(DmOp::Table, TaskStep::NextTarget);
    let mapper = DeviceMapper::new(kernel);

    match mapper.get_table("dev").unwrap_err() {
        DevmapperError::Task { op, step, name, .. } => {
            assert_eq!(op, DmOp::Table);
            assert_eq!(step, TaskStep::NextTarget);
            assert_eq!(name, "dev");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn wipe_table_of_unknown_device_fails_at_run() {
    let kernel = FakeKernel::default();
    let mapper = DeviceMapper::new(kernel);

    assert!(matches!(
        mapper.wipe_table("ghost").unwrap_err(),
        DevmapperError::Task {
            op: DmOp::Table,
            step: TaskStep::Run,
            ..
        }
    ));
}

#[test]
fn setup_reports_the_failing_step() {
    for step in [
        TaskStep::Create,
        TaskStep::SetName,
        TaskStep::AddTarget,
        TaskStep::Run,
    ] {
        let kernel = FakeKernel::default();
        kernel.fail_at(DmOp::Create, step);
        let mapper = DeviceMapper::new(kernel.clone());
        let table = DevmapperTable::new(0, 8, "zero", SecureBytes::from("-"));

        match mapper.setup("dev", &table).unwrap_err() {
            DevmapperError::Task {
                op, step: failed, ..
            } => {
                assert_eq!(op, DmOp::Create);
                assert_eq!(failed, step);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(kernel.rows_opt("dev").is_none());
    }
}

#[test]
fn setup_of_existing_device_fails() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    let mapper = DeviceMapper::new(kernel.clone());
    let table = DevmapperTable::new(0, 8, "zero", SecureBytes::from("-"));

    mapper.setup("dup", &table)?;
    let err = mapper.setup("dup", &table).unwrap_err();
    assert!(err.to_string().contains("already exists"));
    Ok(())
}

#[test]
fn remove_waits_for_udev_and_drops_the_device() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    kernel.seed("gone", &[(0, 10, "linear")]);
    let mapper = DeviceMapper::new(kernel.clone());

    mapper.remove("gone")?;
    assert!(kernel.rows_opt("gone").is_none());
    assert_eq!(
        kernel.calls(),
        vec![
            "create_task remove",
            "set_name remove gone",
            "run remove udev_sync=true",
        ]
    );

    assert!(matches!(
        mapper.remove("gone").unwrap_err(),
        DevmapperError::Task {
            op: DmOp::Remove,
            step: TaskStep::Run,
            ..
        }
    ));
    Ok(())
}

#[test]
fn setup_crypt_enables_discards_when_supported() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    let mapper = DeviceMapper::new(kernel.clone());
    let spec = CryptSpec::new(SecureBytes::from(vec![0x5a; 32]), "/dev/loop4");

    assert!(mapper.setup_crypt("stateful", 4096, &spec)?);
    let table = mapper.get_table("stateful")?;
    assert!(table.parameters().ends_with(b" 1 allow_discards"));
    assert_eq!(table.crypt_key().unwrap(), spec.key);
    Ok(())
}

#[test]
fn setup_crypt_retries_without_discards() -> DevmapperResult<()> {
    let kernel = FakeKernel::default();
    kernel.reject_discards();
    let mapper = DeviceMapper::new(kernel.clone());
    let spec = CryptSpec::new(SecureBytes::from(vec![0x5a; 32]), "/dev/loop4");

    assert!(!mapper.setup_crypt("stateful", 4096, &spec)?);
    let table = mapper.get_table("stateful")?;
    assert!(table.parameters().ends_with(b"/dev/loop4 0"));
    assert_eq!(
        kernel
            .calls()
            .iter()
            .filter(|call| call.as_str() == "run create udev_sync=true")
            .count(),
        2
    );
    Ok(())
}

#[test]
fn setup_crypt_without_discards_makes_one_attempt() {
    let kernel = FakeKernel::default();
    kernel.fail_at(DmOp::Create, TaskStep::Run);
    let mapper = DeviceMapper::new(kernel.clone());
    let mut spec = CryptSpec::new(SecureBytes::from(vec![0x01; 16]), "/dev/loop4");
    spec.allow_discards = false;

    assert!(mapper.setup_crypt("stateful", 64, &spec).is_err());
    assert_eq!(
        kernel
            .calls()
            .iter()
            .filter(|call| call.starts_with("create_task"))
            .count(),
        1
    );
}

#[derive(Debug, thiserror::Error)]
#[error("fake kernel: {0}")]
struct FakeError(String);

#[derive(Default)]
struct KernelState {
    devices: BTreeMap<String, Vec<TargetRow>>,
    calls: Vec<String>,
    fail: Option<(DmOp, TaskStep)>,
    reject_discards: bool,
}

/// In-memory device-mapper: a name → rows map plus a log of every task call.
#[derive(Clone, Default)]
struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    fn seed(&self, name: &str, rows: &[(u64, u64, &str)]) {
        let rows = rows
            .iter()
            .map(|(start, size, target_type)| TargetRow {
                start: *start,
                size: *size,
                target_type: target_type.to_string(),
                parameters: SecureBytes::from(format!("aes-xts-plain64 {KEY_HEX} 0 /dev/sdz 0").as_str()),
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(name.to_string(), rows);
    }

    fn fail_at(&self, op: DmOp, step: TaskStep) {
        self.state.lock().unwrap().fail = Some((op, step));
    }

    fn reject_discards(&self) {
        self.state.lock().unwrap().reject_discards = true;
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn rows_opt(&self, name: &str) -> Option<Vec<TargetRow>> {
        self.state.lock().unwrap().devices.get(name).cloned()
    }

    fn rows(&self, name: &str) -> Vec<TargetRow> {
        self.rows_opt(name).expect("device should exist")
    }
}

impl DevmapperTaskFactory for FakeKernel {
    type Task = FakeTask;

    fn create_task(&self, op: DmOp) -> Result<FakeTask, FakeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_task {op}"));
        if state.fail == Some((op, TaskStep::Create)) {
            return Err(FakeError("out of memory".into()));
        }
        Ok(FakeTask {
            op,
            state: self.state.clone(),
            name: String::new(),
            targets: Vec::new(),
            rows: VecDeque::new(),
        })
    }
}

struct FakeTask {
    op: DmOp,
    state: Arc<Mutex<KernelState>>,
    name: String,
    targets: Vec<TargetRow>,
    rows: VecDeque<TargetRow>,
}

impl FakeTask {
    fn record(&self, step: TaskStep, call: String) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.fail == Some((self.op, step)) {
            return Err(FakeError(format!("injected {step} failure")));
        }
        Ok(())
    }
}

impl DevmapperTask for FakeTask {
    type Error = FakeError;

    fn set_name(&mut self, name: &str) -> Result<(), FakeError> {
        self.record(TaskStep::SetName, format!("set_name {} {name}", self.op))?;
        self.name = name.to_string();
        Ok(())
    }

    fn add_target(
        &mut self,
        start: u64,
        size: u64,
        target_type: &str,
        parameters: &[u8],
    ) -> Result<(), FakeError> {
        self.record(
            TaskStep::AddTarget,
            format!("add_target {} {start} {size} {target_type}", self.op),
        )?;
        self.targets.push(TargetRow {
            start,
            size,
            target_type: target_type.to_string(),
            parameters: SecureBytes::from(parameters),
        });
        Ok(())
    }

    fn run(&mut self, udev_sync: bool) -> Result<(), FakeError> {
        self.record(
            TaskStep::Run,
            format!("run {} udev_sync={udev_sync}", self.op),
        )?;
        let mut state = self.state.lock().unwrap();
        match self.op {
            DmOp::Create => {
                if state.devices.contains_key(&self.name) {
                    return Err(FakeError(format!("{} already exists", self.name)));
                }
                let wants_discards = self
                    .targets
                    .iter()
                    .any(|row| row.parameters.ends_with(b"allow_discards"));
                if state.reject_discards && wants_discards {
                    return Err(FakeError("invalid argument".into()));
                }
                state
                    .devices
                    .insert(self.name.clone(), std::mem::take(&mut self.targets));
            }
            DmOp::Remove => {
                state
                    .devices
                    .remove(&self.name)
                    .ok_or_else(|| FakeError(format!("{} does not exist", self.name)))?;
            }
            DmOp::Table => {
                let rows = state
                    .devices
                    .get(&self.name)
                    .ok_or_else(|| FakeError(format!("{} does not exist", self.name)))?;
                self.rows = rows.iter().cloned().collect();
            }
            DmOp::Reload => {
                let rows = state
                    .devices
                    .get_mut(&self.name)
                    .ok_or_else(|| FakeError(format!("{} does not exist", self.name)))?;
                *rows = std::mem::take(&mut self.targets);
            }
        }
        Ok(())
    }

    fn next_target(&mut self) -> Result<Option<TargetRow>, FakeError> {
        self.record(TaskStep::NextTarget, format!("next_target {}", self.op))?;
        Ok(self.rows.pop_front())
    }
}
