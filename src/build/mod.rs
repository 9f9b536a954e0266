pub mod gradle;
pub mod maven;
pub mod output;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions,
    RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use flate2::read::GzDecoder;
use futures::StreamExt;
use tar::Archive;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{HandlerError, SetupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JvmKind {
    Maven,
    Gradle,
}

impl JvmKind {
    fn image(&self) -> &'static str {
        match self {
            JvmKind::Maven => "crab-maven",
            JvmKind::Gradle => "crab-gradle",
        }
    }

    fn compile_cmd(&self) -> &'static [&'static str] {
        match self {
            JvmKind::Maven => maven::COMPILE_CMD,
            JvmKind::Gradle => gradle::COMPILE_CMD,
        }
    }

    fn test_cmd(&self) -> &'static [&'static str] {
        match self {
            JvmKind::Maven => maven::TEST_CMD,
            JvmKind::Gradle => gradle::TEST_CMD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TestSummary {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
}

/// A resolved, not-yet-entered build handler: either a real JVM project
/// running inside a scoped container, or a sleeping stub for tests.
pub enum AnyBuildHandler {
    Jvm(JvmBuildHandler),
    Mock(MockBuildHandler),
}

impl AnyBuildHandler {
    pub async fn enter(&mut self) -> Result<(), HandlerError> {
        match self {
            AnyBuildHandler::Jvm(h) => h.enter().await,
            AnyBuildHandler::Mock(h) => h.enter().await,
        }
    }

    pub async fn exit(&mut self) {
        match self {
            AnyBuildHandler::Jvm(h) => h.exit().await,
            AnyBuildHandler::Mock(h) => h.exit().await,
        }
    }

    pub fn inject_changes(&self, changes: &HashMap<String, String>) -> Result<(), HandlerError> {
        match self {
            AnyBuildHandler::Jvm(h) => inject_changes(&h.repo_path, changes),
            AnyBuildHandler::Mock(h) => inject_changes(&h.repo_path, changes),
        }
    }

    pub async fn compile_repo(&self) -> Result<(), HandlerError> {
        match self {
            AnyBuildHandler::Jvm(h) => h.compile_repo().await,
            AnyBuildHandler::Mock(h) => h.compile_repo().await,
        }
    }

    pub async fn test_repo(&self) -> Result<TestSummary, HandlerError> {
        match self {
            AnyBuildHandler::Jvm(h) => h.test_repo().await,
            AnyBuildHandler::Mock(h) => h.test_repo().await,
        }
    }

    /// Coverage for a single source file across every JaCoCo report found in
    /// the repo, generating (and injecting, if absent) the report first.
    pub async fn get_coverage_for_file(&self, source_path: &str) -> Result<Vec<(PathBuf, f64)>, HandlerError> {
        match self {
            AnyBuildHandler::Jvm(h) => h.get_coverage_for_file(source_path).await,
            AnyBuildHandler::Mock(_) => Ok(vec![(PathBuf::from("mock/jacoco.xml"), 100.0)]),
        }
    }
}

/// A real Maven or Gradle project materialized under a temp directory, with
/// a scoped container lifetime bound to it.
pub struct JvmBuildHandler {
    pub kind: JvmKind,
    pub repo_path: PathBuf,
    docker: Docker,
    container_id: Option<String>,
    _workdir: tempfile::TempDir,
}

/// One hour, enforced by the caller around `compile_repo`/`test_repo`.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

impl JvmBuildHandler {
    /// Starts a long-running container from the kind's fixed image,
    /// bind-mounting the repo at `/repo`, running as the host uid:gid, kept
    /// alive with `tail -f /dev/null`. Must run on every exit path.
    pub async fn enter(&mut self) -> Result<(), HandlerError> {
        let name = format!("crab-build-{}", uuid::Uuid::new_v4().simple());
        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/repo", self.repo_path.display())]),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(self.kind.image().to_string()),
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            user: Some(host_uid_gid()),
            host_config: Some(host_config),
            working_dir: Some("/repo".to_string()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await
            .map_err(|e| HandlerError::Container(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| HandlerError::Container(e.to_string()))?;

        self.container_id = Some(created.id);
        Ok(())
    }

    /// Kills and removes the container, then recursively deletes the temp
    /// directory. Never fails loudly: a teardown error is logged, not
    /// propagated, since the worker has already produced its result.
    pub async fn exit(&mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.docker.kill_container(&id, None::<KillContainerOptions<String>>).await {
                tracing::warn!(container_id = %id, error = %e, "failed to kill build container");
            }
            let opts = RemoveContainerOptions { force: true, ..Default::default() };
            if let Err(e) = self.docker.remove_container(&id, Some(opts)).await {
                tracing::warn!(container_id = %id, error = %e, "failed to remove build container");
            }
        }
    }

    async fn exec(&self, cmd: &[&str]) -> Result<(String, bool), HandlerError> {
        let id = self.container_id.as_deref().ok_or_else(|| {
            HandlerError::Container("build container was not entered".to_string())
        })?;

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some("/repo".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HandlerError::Container(e.to_string()))?;

        let mut raw_output = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| HandlerError::Container(e.to_string()))?
        {
            while let Some(Ok(chunk)) = output.next().await {
                raw_output.push_str(&chunk.to_string());
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| HandlerError::Container(e.to_string()))?;
        let success = inspected.exit_code.unwrap_or(1) == 0;

        Ok((output::clean_output(&raw_output), success))
    }

    pub async fn compile_repo(&self) -> Result<(), HandlerError> {
        let (cleaned, success) = self.exec(self.kind.compile_cmd()).await?;
        if success {
            Ok(())
        } else {
            Err(HandlerError::CompileFailed(cleaned))
        }
    }

    pub async fn test_repo(&self) -> Result<TestSummary, HandlerError> {
        let (cleaned, success) = self.exec(self.kind.test_cmd()).await?;
        if !success {
            return Err(HandlerError::TestFailed(cleaned));
        }
        match self.kind {
            JvmKind::Maven => maven::extract_test_numbers(&cleaned),
            JvmKind::Gradle => {
                let report_path = self.repo_path.join("build/reports/tests/test/index.html");
                let html = std::fs::read_to_string(&report_path)
                    .map_err(|e| HandlerError::Io(e.to_string()))?;
                gradle::extract_test_numbers(&html)
            }
        }
    }

    /// Injects the coverage plugin if absent, regenerates the test report,
    /// and retries once; restores the original build file on any failure.
    pub async fn generate_coverage_report(&self) -> Result<(), HandlerError> {
        let build_file = match self.kind {
            JvmKind::Maven => self.repo_path.join("pom.xml"),
            JvmKind::Gradle => self.repo_path.join("build.gradle"),
        };
        let original = std::fs::read_to_string(&build_file).map_err(|e| HandlerError::Io(e.to_string()))?;

        let injected = match self.kind {
            JvmKind::Maven => maven::inject_jacoco_plugin(&original),
            JvmKind::Gradle => gradle::inject_jacoco_plugin(&original),
        };
        if injected != original {
            std::fs::write(&build_file, &injected).map_err(|e| HandlerError::Io(e.to_string()))?;
        }

        match self.test_repo().await {
            Ok(_) => Ok(()),
            Err(first_err) => {
                // Retry once after injection; a second failure restores the
                // original build file and is fatal.
                match self.test_repo().await {
                    Ok(_) => Ok(()),
                    Err(_) => {
                        if let Err(e) = std::fs::write(&build_file, &original) {
                            tracing::warn!(error = %e, "failed to restore original build file");
                        }
                        Err(HandlerError::CoverageInjectionFailed(first_err.reason_for_failure()))
                    }
                }
            }
        }
    }

    fn jacoco_report_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.repo_path).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            match self.kind {
                JvmKind::Maven => {
                    if path.file_name().map(|n| n == "jacoco.xml").unwrap_or(false)
                        && path.to_string_lossy().contains("target/site")
                    {
                        paths.push(path.to_path_buf());
                    }
                }
                JvmKind::Gradle => {
                    if path.file_name().map(|n| n == "index.html").unwrap_or(false)
                        && path.to_string_lossy().contains("reports/jacoco")
                    {
                        paths.push(path.to_path_buf());
                    }
                }
            }
        }
        paths
    }

    /// Resolves a source path's fully-qualified class name and reports its
    /// line coverage percentage from every matching JaCoCo report.
    pub async fn get_coverage_for_file(&self, source_path: &str) -> Result<Vec<(PathBuf, f64)>, HandlerError> {
        let full_path = self.repo_path.join(source_path);
        if !full_path.exists() {
            return Err(HandlerError::FileNotFoundInRepo(source_path.to_string()));
        }
        if full_path.extension().and_then(|e| e.to_str()) != Some("java") {
            return Err(HandlerError::NotJavaFile(source_path.to_string()));
        }

        let contents = std::fs::read_to_string(&full_path).map_err(|e| HandlerError::Io(e.to_string()))?;
        let package = extract_java_package(&contents)
            .ok_or_else(|| HandlerError::NoPackageFound(source_path.to_string()))?;

        let basename = full_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| HandlerError::NotJavaFile(source_path.to_string()))?;
        let fqc = format!("{}/{}", package.replace('.', "/"), basename);
        let base_filename = full_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        self.generate_coverage_report().await?;

        let mut hits = Vec::new();
        for report in self.jacoco_report_paths() {
            if let Some(coverage) = coverage_from_jacoco_xml(&report, base_filename, &fqc) {
                hits.push((report, coverage));
            }
        }

        if hits.is_empty() {
            return Err(HandlerError::FileNotCovered(source_path.to_string()));
        }
        Ok(hits)
    }
}

fn extract_java_package(source: &str) -> Option<String> {
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("package ") {
            return Some(rest.trim_end_matches(';').trim().to_string());
        }
    }
    None
}

/// Parses a single `jacoco.xml` report for the line-coverage percentage of
/// one class. Returns `None` if the class isn't listed at all; `Some(-1.0)`
/// per the spec's "class not listed" sentinel is instead folded into `None`
/// here since the caller already treats "no hit" the same way.
fn coverage_from_jacoco_xml(report_path: &Path, base_filename: &str, fqc: &str) -> Option<f64> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let xml = std::fs::read_to_string(report_path).ok()?;
    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text = true;

    let mut in_target_class = false;
    let mut covered = 0u64;
    let mut missed = 0u64;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = e.name();
                let local_name = String::from_utf8_lossy(local.as_ref()).to_string();
                if local_name == "class" {
                    let mut sourcefile = None;
                    let mut name = None;
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr.unescape_value().ok().map(|v| v.to_string());
                        match key.as_str() {
                            "sourcefilename" => sourcefile = value,
                            "name" => name = value,
                            _ => {}
                        }
                    }
                    in_target_class = sourcefile.as_deref() == Some(base_filename)
                        && name.as_deref() == Some(fqc);
                } else if local_name == "counter" && in_target_class {
                    let mut counter_type = None;
                    let mut missed_attr = None;
                    let mut covered_attr = None;
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr.unescape_value().ok().map(|v| v.to_string());
                        match key.as_str() {
                            "type" => counter_type = value,
                            "missed" => missed_attr = value,
                            "covered" => covered_attr = value,
                            _ => {}
                        }
                    }
                    if counter_type.as_deref() == Some("LINE") {
                        missed = missed_attr.and_then(|v| v.parse().ok()).unwrap_or(0);
                        covered = covered_attr.and_then(|v| v.parse().ok()).unwrap_or(0);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let local_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local_name == "class" && in_target_class {
                    let denom = covered + missed;
                    return Some(if denom == 0 { 0.0 } else { covered as f64 / denom as f64 * 100.0 });
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// A sleeping stub used when `MOCK_BUILD_HANDLER` is set: every step
/// succeeds after a short delay, for exercising the evaluator/transport
/// without Docker.
pub struct MockBuildHandler {
    pub repo_path: PathBuf,
    _workdir: tempfile::TempDir,
}

impl MockBuildHandler {
    pub async fn enter(&mut self) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    pub async fn exit(&mut self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pub async fn compile_repo(&self) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    pub async fn test_repo(&self) -> Result<TestSummary, HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(TestSummary { total: 1, passed: 1, failed: 0 })
    }
}

/// Writes each `filename -> content` pair into the repo root, rejecting any
/// path whose lexical resolution escapes it.
pub fn inject_changes(repo_root: &Path, changes: &HashMap<String, String>) -> Result<(), HandlerError> {
    let canonical_root = repo_root
        .canonicalize()
        .map_err(|e| HandlerError::Io(e.to_string()))?;

    for (filename, content) in changes {
        let joined = repo_root.join(filename);
        let resolved = lexically_normalize(&joined);
        if !resolved.starts_with(&canonical_root) {
            return Err(HandlerError::PathEscape(filename.clone()));
        }
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HandlerError::Io(e.to_string()))?;
        }
        std::fs::write(&resolved, content).map_err(|e| HandlerError::Io(e.to_string()))?;
    }
    Ok(())
}

/// Resolves `..`/`.` components without touching the filesystem, so a path
/// that doesn't exist yet can still be checked for escape.
fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(unix)]
fn host_uid_gid() -> String {
    unsafe { format!("{}:{}", libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn host_uid_gid() -> String {
    "1000:1000".to_string()
}

/// Extracts a gzip tarball into a fresh temp directory, then scans its top
/// level for exactly one recognized build file.
async fn extract_archive(archive_path: &Path) -> Result<(tempfile::TempDir, JvmKind), SetupError> {
    if !archive_path.exists() {
        return Err(SetupError::ArchiveNotFound(archive_path.display().to_string()));
    }

    let workdir = tempfile::tempdir().map_err(|e| SetupError::Io(e.to_string()))?;
    let dest = workdir.path().to_path_buf();
    let archive_path = archive_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), SetupError> {
        let file = std::fs::File::open(&archive_path).map_err(|e| SetupError::Io(e.to_string()))?;
        let decoder = GzDecoder::new(file);
        let mut archive = Archive::new(decoder);
        archive
            .unpack(&dest)
            .map_err(|_| SetupError::NotATarball(archive_path.display().to_string()))
    })
    .await
    .map_err(|e| SetupError::Io(e.to_string()))??;

    let has_pom = workdir.path().join("pom.xml").exists();
    let has_gradle = workdir.path().join("build.gradle").exists();

    let kind = match (has_pom, has_gradle) {
        (true, false) => JvmKind::Maven,
        (false, true) => JvmKind::Gradle,
        (true, true) => return Err(SetupError::AmbiguousBuildFile),
        (false, false) => return Err(SetupError::NoBuildFileFound),
    };

    Ok((workdir, kind))
}

/// Resolves a `<repo>_<pr>_<state>.tar.gz` archive into a usable build
/// handler. Returns the mock handler immediately if `MOCK_BUILD_HANDLER` is
/// set, bypassing archive extraction entirely.
pub async fn get_build_handler(config: &Config, archive_name: &str) -> Result<AnyBuildHandler, SetupError> {
    if config.mock_build_handler {
        let workdir = tempfile::tempdir().map_err(|e| SetupError::Io(e.to_string()))?;
        let repo_path = workdir.path().to_path_buf();
        return Ok(AnyBuildHandler::Mock(MockBuildHandler { repo_path, _workdir: workdir }));
    }

    let archive_path = config.archives_root.join(archive_name);
    let (workdir, kind) = extract_archive(&archive_path).await?;
    let repo_path = workdir.path().to_path_buf();

    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| SetupError::Io(format!("docker connection failed: {e}")))?;

    Ok(AnyBuildHandler::Jvm(JvmBuildHandler {
        kind,
        repo_path,
        docker,
        container_id: None,
        _workdir: workdir,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_changes_rejects_parent_dir_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let mut changes = HashMap::new();
        changes.insert("../evil.txt".to_string(), "pwned".to_string());

        let err = inject_changes(&repo, &changes).unwrap_err();
        assert!(matches!(err, HandlerError::PathEscape(_)));
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[test]
    fn inject_changes_writes_nested_file_within_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let mut changes = HashMap::new();
        changes.insert("src/main/A.java".to_string(), "class A {}".to_string());

        inject_changes(&repo, &changes).unwrap();
        let written = std::fs::read_to_string(repo.join("src/main/A.java")).unwrap();
        assert_eq!(written, "class A {}");
    }

    #[test]
    fn extract_java_package_finds_declaration() {
        let src = "package com.example.foo;\n\npublic class A {}\n";
        assert_eq!(extract_java_package(src), Some("com.example.foo".to_string()));
    }

    #[test]
    fn extract_java_package_none_when_absent() {
        assert_eq!(extract_java_package("public class A {}"), None);
    }

    #[test]
    fn coverage_from_jacoco_xml_computes_percentage() {
        let tmp = tempfile::tempdir().unwrap();
        let report = tmp.path().join("jacoco.xml");
        std::fs::write(
            &report,
            r#"<?xml version="1.0"?>
<report>
  <package name="com/example">
    <class name="com/example/Foo" sourcefilename="Foo.java">
      <counter type="INSTRUCTION" missed="1" covered="9"/>
      <counter type="LINE" missed="2" covered="8"/>
    </class>
  </package>
</report>"#,
        )
        .unwrap();

        let coverage = coverage_from_jacoco_xml(&report, "Foo.java", "com/example/Foo");
        assert_eq!(coverage, Some(80.0));
    }

    #[test]
    fn coverage_from_jacoco_xml_none_when_class_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let report = tmp.path().join("jacoco.xml");
        std::fs::write(&report, "<report></report>").unwrap();
        assert_eq!(coverage_from_jacoco_xml(&report, "Foo.java", "com/example/Foo"), None);
    }

    #[tokio::test]
    async fn mock_build_handler_is_returned_when_configured() {
        let mut config = Config::default();
        config.mock_build_handler = true;
        let handler = get_build_handler(&config, "unused.tar.gz").await.unwrap();
        assert!(matches!(handler, AnyBuildHandler::Mock(_)));
    }

    #[tokio::test]
    async fn missing_archive_is_a_setup_error() {
        let config = Config::default();
        let err = extract_archive(&config.archives_root.join("nope.tar.gz")).await.unwrap_err();
        assert!(matches!(err, SetupError::ArchiveNotFound(_)));
    }

}
