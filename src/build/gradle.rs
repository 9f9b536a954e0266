use regex::Regex;
use std::sync::OnceLock;

use crate::error::HandlerError;

use super::TestSummary;

pub const COMPILE_CMD: &[&str] = &["gradle", "--no-daemon", "compileJava"];
pub const TEST_CMD: &[&str] = &["gradle", "--no-daemon", "test"];

fn counter_re(box_id: &str) -> Regex {
    Regex::new(&format!(
        r#"(?s)id="{box_id}".*?class="counter">\s*(\d+)\s*</div>"#
    ))
    .unwrap()
}

fn tests_counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| counter_re("tests"))
}

fn failures_counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| counter_re("failures"))
}

/// Reads the `div.infoBox#tests > div.counter` and
/// `div.infoBox#failures > div.counter` values out of Gradle's
/// `build/reports/tests/test/index.html`.
pub fn extract_test_numbers(html: &str) -> Result<TestSummary, HandlerError> {
    let total: i64 = tests_counter_re()
        .captures(html)
        .and_then(|c| c[1].parse().ok())
        .ok_or(HandlerError::NoTestResults)?;
    let failed: i64 = failures_counter_re()
        .captures(html)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);

    Ok(TestSummary { total, failed, passed: total - failed })
}

pub const JACOCO_GROOVY_BLOCK: &str = "apply plugin: 'jacoco'\n\njacoco {\n    toolVersion = \"0.8.12\"\n}\n\ntest {\n    finalizedBy jacocoTestReport\n}\n\n";

/// Prepends the JaCoCo plugin block to `build.gradle` unless it is already
/// applied (either via the plugins DSL or the legacy `apply plugin` form).
/// Idempotent.
pub fn inject_jacoco_plugin(build_gradle: &str) -> String {
    if build_gradle.contains("id 'jacoco'")
        || build_gradle.contains("id \"jacoco\"")
        || build_gradle.contains("apply plugin: 'jacoco'")
        || build_gradle.contains("apply plugin: \"jacoco\"")
    {
        return build_gradle.to_string();
    }
    format!("{JACOCO_GROOVY_BLOCK}{build_gradle}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_infobox_counters() {
        let html = r#"
            <div class="infoBox" id="tests"><div class="counter">12</div></div>
            <div class="infoBox" id="failures"><div class="counter">2</div></div>
        "#;
        let summary = extract_test_numbers(html).unwrap();
        assert_eq!(summary.total, 12);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.passed, 10);
    }

    #[test]
    fn missing_counters_is_an_error() {
        assert!(extract_test_numbers("<html></html>").is_err());
    }

    #[test]
    fn injection_is_idempotent() {
        let build = "id 'jacoco'\napply plugin: 'java'\n";
        assert_eq!(inject_jacoco_plugin(build), build);
    }

    #[test]
    fn prepends_block_when_absent() {
        let build = "apply plugin: 'java'\n";
        let out = inject_jacoco_plugin(build);
        assert!(out.starts_with("apply plugin: 'jacoco'"));
        assert!(out.contains("apply plugin: 'java'"));
    }
}
