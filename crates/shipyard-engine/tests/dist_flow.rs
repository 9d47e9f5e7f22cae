#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use shipyard_config::{Config, ProjectSettings};
use shipyard_engine::source::CommitFlags;
use shipyard_engine::{
    build, dist, scripts, DistOptions, DistOutcome, EngineError, JobRun, Project, ReleaseSummary, Services,
};

use support::{CopyCall, FakeDocker, FakeFpm, FakeProvider, FakePublisher, FakeSource};

const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

const CONFIG: &str = r#"
[repos.repoA]
bucket = "apt-a"

[repos.repoB]
bucket = "apt-b"
"#;

const FOO_SETTINGS: &str = r#"
[packages.branch_codenames]
master = "stable"

[jobs.api]
builder = "make"

[[jobs.api.packages]]
name = "foo"
type = "debian"
repos = ["repoA", "repoB"]
promote_through = ["unstable", "stable"]
target = "install"
"#;

struct Env {
    _home: tempfile::TempDir,
    config: Config,
    project: Project,
    settings: ProjectSettings,
    scripts_dir: PathBuf,
}

impl Env {
    fn new(settings: &str) -> Self {
        let home = tempfile::tempdir().unwrap();
        let mut config = Config::from_str_at(CONFIG, Path::new("config.toml")).unwrap();
        config.defaults.home = home.path().to_path_buf();
        config.defaults.ssh_dir = Some(home.path().join("ssh"));
        let scripts_dir = scripts::materialise(home.path()).unwrap();
        let project = Project::new("git://example.com/acme/foo.git", home.path(), "master", "api").unwrap();
        Self {
            config,
            project,
            settings: ProjectSettings::from_str_at(settings, Path::new("shipyard.toml")).unwrap(),
            scripts_dir,
            _home: home,
        }
    }

    fn run<'a>(&'a self, source: &'a FakeSource) -> JobRun<'a> {
        JobRun {
            config: &self.config,
            project: &self.project,
            settings: &self.settings,
            source,
            scripts_dir: &self.scripts_dir,
        }
    }
}

struct Fakes {
    docker: FakeDocker,
    fpm: FakeFpm,
    publisher: Arc<FakePublisher>,
    provider: FakeProvider,
}

impl Fakes {
    fn new(docker: FakeDocker) -> Self {
        let publisher = Arc::new(FakePublisher::default());
        Self {
            docker,
            fpm: FakeFpm::default(),
            provider: FakeProvider(publisher.clone()),
            publisher,
        }
    }

    fn services(&self) -> Services<'_> {
        Services {
            runtime: &self.docker,
            image_builder: &self.docker,
            packaging: &self.fpm,
            publishers: &self.provider,
        }
    }
}

fn codename(name: &str) -> DistOptions {
    DistOptions {
        codename: Some(name.to_owned()),
        ..DistOptions::default()
    }
}

#[test]
fn already_published_package_triggers_no_build_and_no_copy() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker::default());
    fakes.publisher.publish("repoA", "stable", "foo", "1.0", COMMIT);
    fakes.publisher.publish("repoB", "stable", "foo", "1.0", COMMIT);
    let source = FakeSource::new(COMMIT);

    let outcome = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();

    assert_eq!(
        outcome,
        DistOutcome::Released(ReleaseSummary {
            already_published: vec!["foo".to_owned()],
            ..ReleaseSummary::default()
        })
    );
    assert_eq!(fakes.docker.created(), 0);
    assert_eq!(fakes.docker.built(), 0);
    assert!(fakes.publisher.copies.lock().unwrap().is_empty());
    assert_eq!(source.tagged(), 1);
}

#[test]
fn promotion_copies_once_per_repo_without_building() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker::default());
    fakes.publisher.publish("repoA", "unstable", "foo", "1.0", COMMIT);
    fakes.publisher.publish("repoB", "unstable", "foo", "1.0", COMMIT);
    let source = FakeSource::new(COMMIT);

    // The codename comes from `branch_codenames`.
    let outcome = dist(&fakes.services(), &env.run(&source), &DistOptions::default()).unwrap();

    let DistOutcome::Released(summary) = outcome else {
        panic!("expected a release, got {outcome:?}");
    };
    assert_eq!(summary.promoted, ["foo"]);
    let copies = fakes.publisher.copies.lock().unwrap().clone();
    let expected = |repo: &str| CopyCall {
        repo: repo.to_owned(),
        package: "foo".to_owned(),
        from: "unstable".to_owned(),
        to: "stable".to_owned(),
        versions: vec!["1.0".to_owned()],
    };
    assert_eq!(copies, vec![expected("repoA"), expected("repoB")]);
    assert!(fakes.publisher.uploads.lock().unwrap().is_empty());
    assert_eq!(fakes.fpm.count(), 0);
    assert_eq!(fakes.docker.created(), 0);
}

#[test]
fn inconsistent_versions_build_package_and_upload() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker::default());
    fakes.publisher.publish("repoA", "unstable", "foo", "1.0", COMMIT);
    fakes.publisher.publish("repoB", "unstable", "foo", "1.1", COMMIT);
    let source = FakeSource::new(COMMIT);

    let outcome = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();

    let DistOutcome::Released(summary) = outcome else {
        panic!("expected a release, got {outcome:?}");
    };
    assert_eq!(summary.packaged, ["foo"]);
    assert!(fakes.publisher.copies.lock().unwrap().is_empty());
    assert_eq!(fakes.docker.built(), 1);
    assert_eq!(fakes.fpm.count(), 1);

    let uploads = fakes.publisher.uploads.lock().unwrap().clone();
    let repos: Vec<&str> = uploads.iter().map(|(repo, _, _)| repo.as_str()).collect();
    assert_eq!(repos, ["repoA", "repoB"]);
    assert!(uploads.iter().all(|(_, codename, _)| codename == "stable"));
    assert!(!uploads[0].2.exists(), "artifact is deleted after upload");

    // Build container plus one extraction container, both removed.
    assert_eq!(fakes.docker.created(), 2);
    assert_eq!(fakes.docker.removed(), fakes.docker.created());
    assert_eq!(fakes.docker.images_removed.lock().unwrap().len(), 1);

    let args = &fakes.fpm.runs.lock().unwrap()[0];
    assert!(args.contains(&format!("Git-Commit-Id: {COMMIT}")));
    assert_eq!(source.tagged(), 1);
}

#[test]
fn failed_build_removes_every_container_and_does_not_tag() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker {
        build_status: 2,
        ..FakeDocker::default()
    });
    let source = FakeSource::new(COMMIT);

    let err = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap_err();

    assert!(matches!(err, EngineError::BuildFailure { status: 2, .. }));
    assert_eq!(fakes.docker.created(), 1);
    assert_eq!(fakes.docker.removed(), fakes.docker.created());
    assert!(fakes.publisher.uploads.lock().unwrap().is_empty());
    assert_eq!(source.tagged(), 0);
}

#[test]
fn failed_extraction_is_reported_and_cleaned_up() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker {
        extract_status: 1,
        ..FakeDocker::default()
    });
    let source = FakeSource::new(COMMIT);

    let err = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap_err();

    assert!(matches!(err, EngineError::ExtractionFailed { ref package, status: 1 } if package == "foo"));
    assert_eq!(fakes.docker.removed(), fakes.docker.created());
    assert_eq!(fakes.docker.images_removed.lock().unwrap().len(), 1);
    assert_eq!(fakes.fpm.count(), 0);
}

#[test]
fn just_build_without_packages_never_touches_a_publisher() {
    let env = Env::new("[jobs.api]\nbuilder = \"make\"\n");
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);
    let options = DistOptions {
        or_just_build: true,
        ..DistOptions::default()
    };

    let outcome = dist(&fakes.services(), &env.run(&source), &options).unwrap();

    assert_eq!(outcome, DistOutcome::Built);
    assert_eq!(fakes.publisher.calls(), 0);
    assert_eq!(fakes.docker.created(), 1);
    assert_eq!(fakes.docker.removed(), 1);
    assert_eq!(fakes.docker.images_removed.lock().unwrap().len(), 1);
    assert_eq!(source.tagged(), 1);
}

#[test]
fn missing_codename_without_just_build_fails() {
    let env = Env::new("[jobs.api]\nbuilder = \"make\"\n");
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);

    let err = dist(&fakes.services(), &env.run(&source), &DistOptions::default()).unwrap_err();

    assert!(matches!(err, EngineError::NoPackagingConfig { ref branch } if branch == "master"));
    assert_eq!(fakes.docker.created(), 0);
}

#[test]
fn ci_skip_skips_everything() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker::default());
    let mut source = FakeSource::new(COMMIT);
    source.flags = CommitFlags::from_summaries(&["Docs [ci skip]"]);

    let outcome = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();

    assert_eq!(outcome, DistOutcome::Skipped);
    assert_eq!(fakes.publisher.calls(), 0);
    assert_eq!(fakes.docker.created(), 0);
    assert_eq!(source.tagged(), 0);
}

#[test]
fn unconfigured_publisher_fails_before_any_container() {
    let settings = FOO_SETTINGS.replace("type = \"debian\"", "type = \"rpm\"");
    let env = Env::new(&settings);
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);

    let err = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap_err();

    assert!(matches!(err, EngineError::PublisherNotConfigured { .. }));
    assert_eq!(fakes.docker.created(), 0);
    assert_eq!(fakes.docker.built(), 0);
}

#[test]
fn unknown_builder_fails_before_any_container() {
    let env = Env::new("[jobs.api]\nbuilder = \"gradle\"\n");
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);

    let err = build(&fakes.services(), &env.run(&source), false).unwrap_err();

    assert!(matches!(err, EngineError::BuilderNotFound { ref builder } if builder == "gradle"));
    assert_eq!(fakes.docker.created(), 0);
}

#[test]
fn unchanged_package_is_not_rebuilt() {
    let settings = format!("{FOO_SETTINGS}\n[jobs.api.packages.files]\nroot = \"server\"\n");
    let env = Env::new(&settings);
    let fakes = Fakes::new(FakeDocker::default());
    let mut source = FakeSource::new(COMMIT);
    source.changed = shipyard_engine::source::ChangedPaths::Paths(vec!["docs/readme.md".to_owned()]);

    let outcome = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();

    let DistOutcome::Released(summary) = outcome else {
        panic!("expected a release, got {outcome:?}");
    };
    assert_eq!(summary.unchanged, ["foo"]);
    assert_eq!(fakes.docker.created(), 0);
    assert_eq!(source.tagged(), 1);
}

#[test]
fn second_build_reuses_the_dependency_image() {
    let env = Env::new("[jobs.api]\nbuilder = \"make\"\n");
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);

    let first = build(&fakes.services(), &env.run(&source), true).unwrap();
    let second = build(&fakes.services(), &env.run(&source), true).unwrap();

    assert_eq!(fakes.docker.built(), 1);
    assert_eq!(first.repository, "foo.api.build");
    assert_eq!(second.tag, "master");
    assert_eq!(fakes.docker.removed(), fakes.docker.created());

    let specs = fakes.docker.specs.lock().unwrap();
    assert_eq!(specs[0].env.get("SKIP_TESTS").map(String::as_str), Some("true"));
}

#[test]
fn uploaded_version_is_listed_on_the_next_run() {
    let env = Env::new(FOO_SETTINGS);
    let fakes = Fakes::new(FakeDocker::default());
    let source = FakeSource::new(COMMIT);

    let first = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();
    let DistOutcome::Released(summary) = first else {
        panic!("expected a release, got {first:?}");
    };
    assert_eq!(summary.packaged, ["foo"]);
    let packaged_version = {
        let runs = fakes.fpm.runs.lock().unwrap();
        let args = &runs[0];
        let at = args.iter().position(|a| a == "-v").unwrap();
        args[at + 1].clone()
    };
    let listed = fakes.publisher.listings.lock().unwrap()[&("repoB".to_owned(), "stable".to_owned())].clone();
    assert_eq!(listed, [("foo".to_owned(), packaged_version, COMMIT.to_owned())]);

    let created = fakes.docker.created();
    let second = dist(&fakes.services(), &env.run(&source), &codename("stable")).unwrap();
    let DistOutcome::Released(summary) = second else {
        panic!("expected a release, got {second:?}");
    };
    assert_eq!(summary.already_published, ["foo"]);
    assert_eq!(fakes.docker.created(), created);
    assert_eq!(fakes.fpm.count(), 1);
}
