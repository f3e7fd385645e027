use std::{fs, io, path::PathBuf};

use crate::backend::kind::BackendKind;

/// `<tmp>/<backend>-service.pid`
pub fn pid_file_path(kind: BackendKind) -> PathBuf {
    std::env::temp_dir().join(format!("{}-service.pid", kind.service_slug()))
}

/// `<tmp>/<backend>-service.log`
pub fn log_file_path(kind: BackendKind) -> PathBuf {
    std::env::temp_dir().join(format!("{}-service.log", kind.service_slug()))
}

pub fn write_pid(path: &PathBuf, pid: u32) -> io::Result<()> {
    fs::write(path, pid.to_string())
}

pub fn read_pid(path: &PathBuf) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

pub fn remove_pid(path: &PathBuf) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                target: "supervisor",
                path = %path.display(),
                error = %err,
                "pid_file_remove_failed"
            );
        }
    }
}
