//! Named statistics writers.
//!
//! Subsystems register a writer at init time; `collect` concatenates every
//! writer's report. The daemon dumps this on SIGUSR1 and at unmount.

use std::fmt::Write as _;

use parking_lot::RwLock;

type Writer = Box<dyn Fn(&mut String) + Send + Sync>;

static WRITERS: RwLock<Vec<(String, Writer)>> = RwLock::new(Vec::new());

pub fn register(name: &str, writer: impl Fn(&mut String) + Send + Sync + 'static) {
    let mut writers = WRITERS.write();

    writers.retain(|(n, _)| n != name);
    writers.push((name.to_string(), Box::new(writer)));
    writers.sort_by(|a, b| a.0.cmp(&b.0));
}

pub fn clear() {
    WRITERS.write().clear();
}

pub fn collect() -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{} {}:", crate::PACKAGE_NAME, crate::PACKAGE_VERSION);

    for (_, writer) in WRITERS.read().iter() {
        writer(&mut out);
    }

    out
}

pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    part as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test so the shared registry is not rebuilt concurrently
    #[test]
    fn registry_behavior() {
        clear();
        register("b section", |out| out.push_str("b\n"));
        register("a section", |out| out.push_str("a\n"));

        let report = collect();
        let a = report.find("a\n").unwrap();
        let b = report.find("b\n").unwrap();
        assert!(a < b);

        register("a section", |out| out.push_str("replaced\n"));

        let report = collect();
        assert!(report.contains("replaced"));
        assert!(!report.contains("a\n"));

        clear();
    }

    #[test]
    fn percent_of_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
    }
}
