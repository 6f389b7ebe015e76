use std::{cell::RefCell, io::Write, sync::Once};

use tempfile::NamedTempFile;
use test_case::test_case;

use super::*;
use crate::autopara::callpath::CallPath;

const DICT: &str = r#"
"workflow.rs::fit, generic.rs::calculate":
  sys_name: cluster
  job_name: fit
  resources:
    max_time: 1h
    num_nodes: 1
    partitions: standard
label_b:
  sys_name: local
  job_name: b
  resources: {max_time: 30m, num_cores: 4, partitions: [short, long]}
  pre_cmds: ["module load aims"]
label_none: null
"#;

/// set `var` for the rest of the process. every test uses its own variable
/// name since tests run concurrently
fn set_env(var: &str, value: &str) {
    // SAFETY: each variable is only touched by a single test
    unsafe { std::env::set_var(var, value) }
}

thread_local! {
    static WARNINGS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// records warnings per thread so concurrent tests only see their own
struct Capture;

impl log::Log for Capture {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            WARNINGS.with_borrow_mut(|w| w.push(record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;

/// run `f` and return its result along with the warnings it logged
fn warnings<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(log::LevelFilter::Warn);
    });
    WARNINGS.with_borrow_mut(Vec::clear);
    let ret = f();
    (ret, WARNINGS.take())
}

fn local_b() -> RemoteInfo {
    RemoteInfo {
        sys_name: "local".to_owned(),
        job_name: "b".to_owned(),
        resources: Resources {
            max_time: "30m".to_owned(),
            num_nodes: None,
            num_cores: Some(4),
            max_mem_per_core: None,
            partitions: Some(crate::string!["short", "long"]),
        },
        num_inputs_per_queued_job: -100,
        pre_cmds: crate::string!["module load aims"],
        post_cmds: Vec::new(),
        env_vars: Vec::new(),
        input_files: Vec::new(),
        output_files: Vec::new(),
        header_extra: Vec::new(),
        exact_fit: true,
        partial_node: false,
        timeout: 3600,
        check_interval: 30,
        ignore_failed_jobs: false,
        resubmit_killed_jobs: false,
        hash_ignore: Vec::new(),
    }
}

#[test_case(1, 0)]
#[test_case(1, 5)]
#[test_case(3, 9)]
#[test_case(3, 10)]
#[test_case(4, 2)]
#[test_case(7, 50)]
fn grouper_sizes(n: usize, len: usize) {
    let input: Vec<usize> = (0..len).collect();
    let groups: Vec<Vec<usize>> = grouper(n, input.clone()).collect();
    assert_eq!(groups.len(), len.div_ceil(n));
    for (i, g) in groups.iter().enumerate() {
        if i + 1 < groups.len() || len % n == 0 {
            assert_eq!(g.len(), n);
        } else {
            assert_eq!(g.len(), len % n);
        }
    }
    assert_eq!(groups.concat(), input);
}

#[test]
fn grouper_is_lazy() {
    let mut pulled = 0;
    let mut g = grouper(2, (0..).inspect(|_| pulled += 1));
    assert_eq!(g.next(), Some(vec![0, 1]));
    assert_eq!(g.next(), Some(vec![2, 3]));
    drop(g);
    assert_eq!(pulled, 4);
}

#[test]
fn grouper_zero() {
    assert_eq!(grouper(0, [1, 2, 3]).next(), None);
    assert_eq!(grouper(0, [1, 2, 3]).size_hint(), (0, Some(0)));
    assert_eq!(grouper(2, [1, 2, 3]).size_hint(), (2, Some(2)));
}

#[test]
fn explicit_wins() {
    let env = "WFL_TEST_EXPLICIT";
    set_env(env, "[not, a, valid");
    let got = get_remote_info(Some(local_b()), Some("label_b"), env).unwrap();
    assert_eq!(got, Some(local_b()));
}

#[test]
fn unset_env() {
    let got =
        get_remote_info(None, Some("label_b"), "WFL_TEST_NEVER_SET").unwrap();
    assert_eq!(got, None);
}

#[test]
fn label_match() {
    let env = "WFL_TEST_LABEL";
    set_env(env, DICT);
    let got = get_remote_info(None, Some("label_b"), env).unwrap();
    assert_eq!(got, Some(local_b()));

    // labels are compared exactly, not as patterns
    let got = get_remote_info(None, Some("label"), env).unwrap();
    assert_eq!(got, None);

    let got = get_remote_info(None, Some("label_none"), env).unwrap();
    assert_eq!(got, None);
}

#[test]
fn direct() {
    let env = "WFL_TEST_DIRECT";
    set_env(
        env,
        r#"{"sys_name": "local", "job_name": "b",
            "pre_cmds": ["module load aims"],
            "resources": {"max_time": "30m", "num_cores": 4,
                          "partitions": ["short", "long"]}}"#,
    );
    // a direct config applies regardless of the label
    let got = get_remote_info(None, Some("anything"), env).unwrap();
    assert_eq!(got, Some(local_b()));
    let got = get_remote_info(None, None, env).unwrap();
    assert_eq!(got, Some(local_b()));
}

#[test]
fn unparseable_is_a_missing_file() {
    let env = "WFL_TEST_UNPARSEABLE";
    set_env(env, "[1, 2");
    let err = get_remote_info(None, None, env).unwrap_err();
    assert!(
        matches!(
            &err,
            RemoteInfoError::Io { path, source }
                if path == "[1, 2"
                    && source.kind() == std::io::ErrorKind::NotFound
        ),
        "{err:?}"
    );
}

#[test]
fn from_file() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(DICT.as_bytes()).unwrap();
    let path = f.path().to_str().unwrap();

    let env = "WFL_TEST_FILE";
    set_env(env, path);
    let got = get_remote_info(None, Some("label_b"), env).unwrap();
    assert_eq!(got, Some(local_b()));

    let config = RemoteInfoConfig::load(path).unwrap();
    let RemoteInfoConfig::Labeled { entries, .. } = &config else {
        panic!("expected a labeled config, got {config:?}");
    };
    let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        keys,
        [
            "workflow.rs::fit, generic.rs::calculate",
            "label_b",
            "label_none"
        ]
    );
}

#[test]
fn bad_file_contents() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"a: [1, 2").unwrap();
    let err = RemoteInfoConfig::load(f.path()).unwrap_err();
    assert!(matches!(err, RemoteInfoError::Yaml { .. }), "{err:?}");
}

#[test]
fn not_a_mapping() {
    let err = RemoteInfoConfig::from_env_value("WFL", "[1, 2]").unwrap_err();
    assert!(matches!(err, RemoteInfoError::NotAMapping { .. }), "{err:?}");
}

#[test]
fn unknown_kwargs() {
    let err = RemoteInfoConfig::from_env_value(
        "WFL",
        "{sys_name: a, job_name: b, resources: {max_time: 1h}, queue: x}",
    )
    .unwrap_err();
    assert!(matches!(err, RemoteInfoError::Kwargs(_)), "{err:?}");
}

#[test_case(
    &["main.rs::main", "workflow.rs::fit", "generic.rs::calculate"],
    Some("cluster");
    "exact tail"
)]
#[test_case(
    &[
        "x/workflow.rs::fit",
        "calculators/generic.rs::calculate",
        "autopara/base.rs::autoparallelize",
        "autopara/utils.rs::get_remote_info",
    ],
    Some("cluster");
    "pass through stripped"
)]
#[test_case(
    &["workflow.rs::fit", "generic.rs::calculate", "other.rs::f"],
    None;
    "wrong tail"
)]
#[test_case(&["generic.rs::calculate"], None; "too short")]
#[test_case(
    &["workflow.rs::fit_more", "generic.rs::calculate"],
    None;
    "anchored at end"
)]
fn path_match(frames: &[&str], want: Option<&str>) {
    let config = RemoteInfoConfig::from_env_value("WFL", DICT).unwrap();
    let path = CallPath::new(frames.iter().copied());
    let got = config.resolve(&Caller::Path(&path)).unwrap();
    assert_eq!(got.map(|r| r.sys_name).as_deref(), want);
}

#[test]
fn regex_patterns() {
    let config = RemoteInfoConfig::from_env_value(
        "WFL",
        "{'fit.*, gen\\w+\\.rs::calc.*': \
         {sys_name: a, job_name: b, resources: {max_time: 1h}}}",
    )
    .unwrap();
    let path =
        CallPath::new(["workflow.rs::fit_mace", "generic.rs::calculate"]);
    let got = config.resolve(&Caller::Path(&path)).unwrap();
    assert_eq!(got.unwrap().sys_name, "a");
}

#[test]
fn bad_pattern() {
    let config = RemoteInfoConfig::from_env_value(
        "WFL",
        "{'fit(': {sys_name: a, job_name: b, resources: {max_time: 1h}}}",
    )
    .unwrap();
    let path = CallPath::new(["workflow.rs::fit("]);
    let err = config.resolve(&Caller::Path(&path)).unwrap_err();
    assert!(matches!(err, RemoteInfoError::Pattern(_)));
}

#[test]
fn thread_call_path() {
    let env = "WFL_TEST_CALL_PATH";
    set_env(env, DICT);
    assert_eq!(get_remote_info(None, None, env).unwrap(), None);

    let _fit = callpath::enter("src/workflow.rs::fit");
    let _calc = callpath::enter("src/calculators/generic.rs::calculate");
    let got = {
        let _auto =
            callpath::enter("wfl/src/autopara/base.rs::autoparallelize");
        get_remote_info(None, None, env).unwrap()
    };
    assert_eq!(got.unwrap().sys_name, "cluster");
    assert_eq!(callpath::current().frames().len(), 2);
}

#[test]
fn frame_macro() {
    let _f = crate::frame!("frame_macro");
    let path = callpath::current();
    assert_eq!(path.frames().len(), 1);
    assert!(path.frames()[0].ends_with("tests.rs::frame_macro"));
}

#[test]
fn frames_dropped_out_of_order() {
    let outer = callpath::enter("outer.rs::a");
    let inner = callpath::enter("inner.rs::b");
    drop(outer);
    assert_eq!(callpath::current().frames(), ["inner.rs::b"]);

    let last = callpath::enter("last.rs::c");
    drop(inner);
    assert_eq!(callpath::current().frames(), ["last.rs::c"]);
    drop(last);
    assert!(callpath::current().frames().is_empty());

    // guards collected into a Vec drop front to back
    let guards: Vec<_> = ["x.rs::x", "y.rs::y", "z.rs::z"]
        .into_iter()
        .map(callpath::enter)
        .collect();
    assert_eq!(callpath::current().frames().len(), 3);
    drop(guards);
    assert!(callpath::current().frames().is_empty());
}

#[test]
fn direct_mapping_warns() {
    let (got, logged) = warnings(|| {
        RemoteInfoConfig::from_env_value(
            "WFL_TEST_DIRECT_WARNING",
            "{sys_name: local, job_name: b, resources: {max_time: 1h}}",
        )
    });
    assert!(matches!(got, Ok(RemoteInfoConfig::Direct(_))), "{got:?}");
    assert_eq!(logged.len(), 1, "{logged:?}");
    assert!(logged[0].starts_with("WFL_TEST_DIRECT_WARNING appears to be"));
    assert!(logged[0].ends_with("using directly"));

    let (got, logged) =
        warnings(|| RemoteInfoConfig::from_env_value("WFL_TEST_DICT", DICT));
    assert!(got.is_ok());
    assert!(logged.is_empty(), "{logged:?}");
}

#[test_case("{a: [1, 2", true ; "with whitespace")]
#[test_case("[1,2", false ; "without whitespace")]
fn unparseable_warns(raw: &str, warned: bool) {
    let (got, logged) = warnings(|| {
        RemoteInfoConfig::from_env_value("WFL_TEST_WHITESPACE", raw)
    });
    assert!(matches!(got, Err(RemoteInfoError::Io { .. })), "{got:?}");
    assert_eq!(
        logged.iter().any(|w| w.contains("has whitespace")),
        warned,
        "{logged:?}"
    );
    if warned {
        assert!(logged[0].contains("WFL_TEST_WHITESPACE"));
    }
}

#[cfg(unix)]
#[test]
fn non_utf8_env_is_a_filename() {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(OsStr::from_bytes(b"remote_\xffinfo.yaml"));
    std::fs::write(&path, DICT).unwrap();

    let env = "WFL_TEST_NON_UTF8";
    // SAFETY: only this test touches the variable
    unsafe { std::env::set_var(env, &path) }
    let got = get_remote_info(None, Some("label_b"), env).unwrap();
    assert_eq!(got, Some(local_b()));

    std::fs::remove_file(&path).unwrap();
    let err = get_remote_info(None, Some("label_b"), env).unwrap_err();
    assert!(
        matches!(
            &err,
            RemoteInfoError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        ),
        "{err:?}"
    );
}
