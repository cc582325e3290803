use std::fs;
use std::sync::mpsc::channel;

use camino::{Utf8Path, Utf8PathBuf};
use tessen::dev::DevSession;
use tessen::transform::from_fn;
use tessen::{
    BuildEngine, Config, Environment, FrontendPipeline, INCOMPLETE_MARKER, SourceFile, TaskState, TessenError,
    Toolchain,
};

struct Project {
    _guard: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Project {
    fn new(files: &[(&str, &str)]) -> Self {
        let guard = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();

        for (path, data) in files {
            let path = root.join("src").join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }

        Self { _guard: guard, root }
    }

    fn config(&self) -> Config {
        Config {
            source_dir: self.root.join("src"),
            output_dir: self.root.join("dest"),
            cache_dir: self.root.join("cache"),
            ..Config::default()
        }
    }

    fn dest(&self, path: &str) -> Utf8PathBuf {
        self.root.join("dest").join(path)
    }
}

/// Stands in for the external transpiler: strips line breaks.
fn pipeline(config: &Config) -> FrontendPipeline {
    let js = from_fn("js", |files: Vec<SourceFile>| {
        files
            .into_iter()
            .map(|file| -> anyhow::Result<SourceFile> {
                let text = String::from_utf8(file.data)?;
                Ok(SourceFile::new(file.path, text.replace('\n', "")))
            })
            .collect()
    });

    FrontendPipeline::new(Toolchain {
        js,
        ..Toolchain::from_config(config)
    })
}

/// File names in `dir`, sorted.
fn names(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn is_hashed(name: &str, stem: &str, ext: &str) -> bool {
    let Some(digest) = name
        .strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(ext))
    else {
        return false;
    };

    digest.len() == 10 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

fn find_manifests(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = Utf8PathBuf::try_from(entry.unwrap().path()).unwrap();
        if path.is_dir() {
            found.extend(find_manifests(&path));
        } else if path.as_str().ends_with("-manifest.json") {
            found.push(path);
        }
    }
    found
}

const SOURCES: &[(&str, &str)] = &[
    ("sass/app.scss", ".button {\n  color: red;\n}\n"),
    ("js/app.js", "console.log(1)\n"),
    ("test.html", "<html>\n  <head>\n    <link href=\"style.css\">\n    <script src=\"app.js\"></script>\n  </head>\n</html>\n"),
    ("img/logo.png", "not really a png"),
];

#[test]
fn full_build_hashes_and_rewrites_everything() {
    let project = Project::new(SOURCES);
    let config = project.config();
    let mut engine = BuildEngine::new(Environment::build(config.clone()), pipeline(&config));

    let report = engine.run_full().unwrap();
    assert!(report.is_success());

    let css = names(&project.dest("css"));
    assert_eq!(css.len(), 1);
    assert!(is_hashed(&css[0], "style", ".css"), "{css:?}");
    assert_eq!(fs::read_to_string(project.dest("css").join(&css[0])).unwrap(), ".button{color:red}");

    let js = names(&project.dest("js"));
    assert_eq!(js.len(), 1);
    assert!(is_hashed(&js[0], "app", ".js"), "{js:?}");
    assert_eq!(fs::read_to_string(project.dest("js").join(&js[0])).unwrap(), "console.log(1)");

    let img = names(&project.dest("img"));
    assert!(is_hashed(&img[0], "logo", ".png"), "{img:?}");

    let html = fs::read_to_string(project.dest("test.html")).unwrap();
    assert_eq!(
        html,
        format!(r#"<html><head><link href="{}"><script src="{}"></script></head></html>"#, css[0], js[0])
    );

    assert!(find_manifests(&project.root.join("dest")).is_empty());
    assert!(!project.dest(INCOMPLETE_MARKER).exists());

    // Unchanged sources give byte-identical names.
    engine.run_full().unwrap();
    assert_eq!(names(&project.dest("css")), css);
    assert_eq!(names(&project.dest("js")), js);
    assert_eq!(fs::read_to_string(project.dest("test.html")).unwrap(), html);
}

#[test]
fn static_files_next_to_stylesheets_and_scripts_ship() {
    let project = Project::new(&[
        ("css/site.css", "body { margin: 0; }"),
        ("css/img/bg.png", "not really a png"),
        ("js/app.js", "console.log(1)\n"),
        ("js/vendor.js.map", "{}"),
        ("index.html", "<img src=\"css/img/bg.png\">"),
    ]);
    let config = project.config();
    let mut engine = BuildEngine::new(Environment::build(config.clone()), pipeline(&config));

    engine.run_full().unwrap();

    let img = names(&project.dest("css/img"));
    assert_eq!(img.len(), 1);
    assert!(is_hashed(&img[0], "bg", ".png"), "{img:?}");

    let js = names(&project.dest("js"));
    assert_eq!(js.len(), 2, "{js:?}");
    assert!(js.iter().any(|name| is_hashed(name, "app", ".js")), "{js:?}");
    assert!(js.iter().any(|name| is_hashed(name, "vendor.js", ".map")), "{js:?}");

    let html = fs::read_to_string(project.dest("index.html")).unwrap();
    assert!(html.contains(&format!("css/img/{}", img[0])), "{html}");
}

#[test]
fn a_broken_stylesheet_fails_only_its_branch() {
    let project = Project::new(&[
        ("sass/app.scss", ".button { color: red;"),
        ("js/app.js", "console.log(1)\n"),
        ("test.html", "<script src=\"app.js\"></script>"),
    ]);
    let config = project.config();
    let mut engine = BuildEngine::new(Environment::build(config.clone()), pipeline(&config));

    let err = engine.run_full().unwrap_err();
    assert_eq!(err.exit_code(), 4);

    let TessenError::BuildFailed(failed) = &err else {
        panic!("expected a build failure, got {err:?}");
    };

    assert_eq!(failed.failures.len(), 1);
    assert_eq!(failed.failures[0].task, "sass");
    assert!(failed.succeeded.contains(&"js".to_string()));
    assert_eq!(engine.state("js"), TaskState::Succeeded);
    assert_eq!(engine.state("css"), TaskState::Pending);

    console::set_colors_enabled(false);
    let summary = failed.render_summary();
    assert!(summary.contains("sass [transform]"), "{summary}");
    assert!(summary.contains("js"), "{summary}");

    // The script branch produced its output.
    assert_eq!(names(&project.dest("js")).len(), 1);
    assert!(find_manifests(&project.root.join("dest")).is_empty());
}

#[test]
fn keep_going_finishes_the_script_branch() {
    let project = Project::new(&[
        ("sass/app.scss", ".button { color: red;"),
        ("js/app.js", "console.log(1)\n"),
        ("test.html", "<script src=\"app.js\"></script>"),
    ]);
    let config = Config {
        keep_going: true,
        ..project.config()
    };
    let mut engine = BuildEngine::new(Environment::build(config.clone()), pipeline(&config));

    let err = engine.run_full().unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert_eq!(engine.state("js"), TaskState::Succeeded);
    assert_eq!(engine.state("assets"), TaskState::Succeeded);
    assert_eq!(engine.state("rewrite:css"), TaskState::Pending);
    assert!(find_manifests(&project.root.join("dest")).is_empty());
}

#[test]
fn touching_a_script_rebuilds_only_the_script_branch() {
    let project = Project::new(SOURCES);
    let config = project.config();
    let mut engine = BuildEngine::new(Environment::watch(config.clone(), 1337), pipeline(&config));
    engine.run_full().unwrap();

    let css = names(&project.dest("css"));
    let old_js = names(&project.dest("js"));

    let (tx, rx) = channel();
    let mut session = DevSession::new(engine, tx);

    let script = project.root.join("src/js/app.js");
    fs::write(&script, "console.log(2)\n").unwrap();

    let report = session.on_change(&[script]).unwrap();

    let ran: Vec<&str> = report.names().collect();
    assert_eq!(ran, vec!["js", "manifests:remove", "rewrite:assets", "rewrite:js"]);
    assert_eq!(rx.try_iter().count(), 1);

    let js = names(&project.dest("js"));
    assert_eq!(js.len(), 1, "the old hashed script is removed");
    assert_ne!(js, old_js);
    assert_eq!(names(&project.dest("css")), css);

    let html = fs::read_to_string(project.dest("test.html")).unwrap();
    assert!(html.contains(&format!(r#"src="{}""#, js[0])), "{html}");
    assert!(html.contains(&format!(r#"href="{}""#, css[0])), "{html}");
    assert!(html.contains("ws://localhost:1337"));
    assert!(find_manifests(&project.root.join("dest")).is_empty());
}

#[test]
fn interrupted_builds_are_flagged() {
    let project = Project::new(SOURCES);
    let config = project.config();
    let mut engine = BuildEngine::new(Environment::build(config.clone()), pipeline(&config));

    engine.cancel_token().cancel();
    let err = engine.run_full().unwrap_err();

    assert!(matches!(err, TessenError::Interrupted));
    assert!(project.dest(INCOMPLETE_MARKER).exists());
}
