use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn login(&self, _user: &str, _conn: u32) {}
    fn login_failed(&self, _user: &str) {}
    fn logout(&self, _user: &str, _conn: u32) {}
    fn sync(&self, _user: &str, _path: &Path, _transferred: bool) {}
    fn remove(&self, _user: &str, _path: &Path) {}
    fn busy(&self, _conn: u32) {}
    fn broken_transfer(&self, _user: &str, _path: &Path, _got: u64, _want: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(f) })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn login(&self, user: &str, conn: u32) {
        self.line(&format!("LOGIN user={} conn={}", user, conn));
    }
    fn login_failed(&self, user: &str) {
        self.line(&format!("LOGIN_FAIL user={}", user));
    }
    fn logout(&self, user: &str, conn: u32) {
        self.line(&format!("LOGOUT user={} conn={}", user, conn));
    }
    fn sync(&self, user: &str, path: &Path, transferred: bool) {
        self.line(&format!(
            "SYNC user={} path={} transferred={}",
            user,
            path.display(),
            transferred
        ));
    }
    fn remove(&self, user: &str, path: &Path) {
        self.line(&format!("RM user={} path={}", user, path.display()));
    }
    fn busy(&self, conn: u32) {
        self.line(&format!("BUSY conn={}", conn));
    }
    fn broken_transfer(&self, user: &str, path: &Path, got: u64, want: u64) {
        self.line(&format!(
            "BROKEN user={} path={} got={} want={}",
            user,
            path.display(),
            got,
            want
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.login("alice", 3);
        logger.busy(4);
        logger.broken_transfer("alice", Path::new("/x"), 10, 20);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("LOGIN user=alice conn=3"));
        assert!(text.contains("BUSY conn=4"));
        assert!(text.contains("got=10 want=20"));
    }
}
