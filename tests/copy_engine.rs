//! End-to-end tests driving the engine through regular files, the only
//! endpoint kind exercisable without real SCSI hardware.

use ddsg::config::{CliArgs, Config};
use ddsg::Coordinator;

fn run(operands: &[&str]) -> Result<i32, ddsg::CopyError> {
    run_with(operands, false, false)
}

fn run_with(operands: &[&str], verify: bool, chkaddr: bool) -> Result<i32, ddsg::CopyError> {
    let args = CliArgs {
        verify,
        prefetch: false,
        dry_run: false,
        chkaddr,
        chkaddr_strict: false,
        verbose: 0,
        operands: operands.iter().map(|s| s.to_string()).collect(),
    };
    let cfg = Config::from_args(&args).expect("valid operands");
    Coordinator::new(cfg)?.run().map(|r| r.exit_code)
}

#[test]
fn sparse_copy_from_zero_device_is_all_zero_bytes() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), vec![0u8; 2048]).unwrap();
    let dst = tempfile::NamedTempFile::new().unwrap();

    let if_arg = format!("if={}", src.path().display());
    let of_arg = format!("of={}", dst.path().display());
    let code = run(&["bs=512", "count=4", &if_arg, &of_arg]).unwrap();
    assert_eq!(code, 0);

    let out = std::fs::read(dst.path()).unwrap();
    assert_eq!(out.len(), 2048);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn self_address_pattern_round_trips_and_chkaddr_passes() {
    let dst = tempfile::NamedTempFile::new().unwrap();
    let of_arg = format!("of={}", dst.path().display());
    let code = run_with(&["bs=512", "count=3", "iflag=00,ff", &of_arg], false, true).unwrap();
    assert_eq!(code, 0);

    let out = std::fs::read(dst.path()).unwrap();
    assert_eq!(&out[0..4], &[0, 0, 0, 0]);
    assert_eq!(&out[512..516], &[0, 0, 0, 1]);
    assert_eq!(&out[1024..1028], &[0, 0, 0, 2]);
}

#[test]
fn count_zero_does_no_io_and_exits_clean() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), vec![0xAAu8; 4096]).unwrap();
    let dst = tempfile::NamedTempFile::new().unwrap();

    let if_arg = format!("if={}", src.path().display());
    let of_arg = format!("of={}", dst.path().display());
    let code = run(&["bs=512", "count=0", &if_arg, &of_arg]).unwrap();
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(dst.path()).unwrap().len(), 0);
}

#[test]
fn mismatched_chkaddr_pattern_reports_miscompare() {
    let src = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(src.path(), vec![0xFFu8; 2048]).unwrap();
    let dst = tempfile::NamedTempFile::new().unwrap();

    let if_arg = format!("if={}", src.path().display());
    let of_arg = format!("of={}", dst.path().display());
    let err = run_with(&["bs=512", "count=4", &if_arg, &of_arg], false, true).unwrap_err();
    assert!(matches!(err, ddsg::CopyError::Miscompare { .. }));
    assert_eq!(err.exit_code(), 3);
}
