use regex::Regex;
use std::sync::OnceLock;

use crate::error::HandlerError;

use super::TestSummary;

pub const COMPILE_CMD: &[&str] = &["mvn", "-B", "compile"];
pub const TEST_CMD: &[&str] = &["mvn", "-B", "test"];

fn tests_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+),\s*Skipped:\s*(\d+)").unwrap()
    })
}

/// Sums every `Tests run: N, Failures: F, Errors: E, Skipped: S` line in the
/// `mvn test` output, since a multi-module build prints one per module.
pub fn extract_test_numbers(output: &str) -> Result<TestSummary, HandlerError> {
    let mut total = 0i64;
    let mut failures = 0i64;
    let mut errors = 0i64;
    let mut skipped = 0i64;
    let mut matched = false;

    for caps in tests_run_re().captures_iter(output) {
        matched = true;
        total += caps[1].parse::<i64>().unwrap_or(0);
        failures += caps[2].parse::<i64>().unwrap_or(0);
        errors += caps[3].parse::<i64>().unwrap_or(0);
        skipped += caps[4].parse::<i64>().unwrap_or(0);
    }

    if !matched {
        return Err(HandlerError::NoTestResults);
    }

    Ok(TestSummary {
        total,
        failed: failures + errors,
        passed: total - failures - errors - skipped,
    })
}

pub const JACOCO_PLUGIN_XML: &str = r#"
            <plugin>
                <groupId>org.jacoco</groupId>
                <artifactId>jacoco-maven-plugin</artifactId>
                <version>0.8.12</version>
                <executions>
                    <execution>
                        <goals><goal>prepare-agent</goal></goals>
                    </execution>
                    <execution>
                        <id>report</id>
                        <phase>test</phase>
                        <goals><goal>report</goal></goals>
                    </execution>
                </executions>
            </plugin>
"#;

/// Injects the JaCoCo plugin block into an existing `<plugins>` section, or
/// synthesizes `<build><plugins>...</plugins></build>` before `</project>`
/// if the pom has no build section at all. Idempotent: a pom that already
/// declares the plugin is returned unchanged.
pub fn inject_jacoco_plugin(pom_xml: &str) -> String {
    if pom_xml.contains("jacoco-maven-plugin") {
        return pom_xml.to_string();
    }
    if let Some(idx) = pom_xml.find("</plugins>") {
        let mut out = String::with_capacity(pom_xml.len() + JACOCO_PLUGIN_XML.len());
        out.push_str(&pom_xml[..idx]);
        out.push_str(JACOCO_PLUGIN_XML);
        out.push_str(&pom_xml[idx..]);
        return out;
    }
    if let Some(idx) = pom_xml.rfind("</project>") {
        let mut out = String::with_capacity(pom_xml.len() + JACOCO_PLUGIN_XML.len() + 64);
        out.push_str(&pom_xml[..idx]);
        out.push_str("<build><plugins>");
        out.push_str(JACOCO_PLUGIN_XML);
        out.push_str("</plugins></build>\n");
        out.push_str(&pom_xml[idx..]);
        return out;
    }
    pom_xml.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_multiple_module_summaries() {
        let out = "Tests run: 5, Failures: 1, Errors: 0, Skipped: 1\nTests run: 3, Failures: 0, Errors: 0, Skipped: 0";
        let summary = extract_test_numbers(out).unwrap();
        assert_eq!(summary.total, 8);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 6);
    }

    #[test]
    fn no_match_is_an_error() {
        assert!(extract_test_numbers("nothing here").is_err());
    }

    #[test]
    fn injects_into_existing_plugins_block() {
        let pom = "<project><build><plugins></plugins></build></project>";
        let out = inject_jacoco_plugin(pom);
        assert!(out.contains("jacoco-maven-plugin"));
    }

    #[test]
    fn synthesizes_build_section_when_absent() {
        let pom = "<project></project>";
        let out = inject_jacoco_plugin(pom);
        assert!(out.contains("<build><plugins>"));
        assert!(out.contains("jacoco-maven-plugin"));
    }

    #[test]
    fn is_idempotent() {
        let pom = "<project><build><plugins></plugins></build></project>";
        let once = inject_jacoco_plugin(pom);
        let twice = inject_jacoco_plugin(&once);
        assert_eq!(once, twice);
    }
}
