use std::path::PathBuf;

use toolchain_bootstrap::config;
use toolchain_bootstrap::context::{BuildContext, Overrides};
use toolchain_bootstrap::fetch::RetrievalMode;
use toolchain_bootstrap::{pipeline, workspace};

fn configs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs")
}

#[test]
fn musl_definition_plans_in_declaration_order() {
    let def = config::load(&configs_dir().join("x86_64-linux-musl.toml")).expect("load");
    let ov = Overrides {
        dry_run: true,
        ..Overrides::default()
    };
    let ctx = BuildContext::resolve(&def, &ov, |_| None).expect("ctx");
    assert_eq!(ctx.target, "x86_64-linux-musl");
    assert_eq!(ctx.tools.get("MAKE").map(String::as_str), Some("make"));
    assert!(ctx.jobs >= 1);

    let stages = pipeline::plan(&def, &ctx).expect("plan");
    let ids: Vec<String> = stages.iter().map(|s| s.id()).collect();
    assert_eq!(
        ids,
        [
            "binutils-2.42-build",
            "linux-6.6.30-headers",
            "gmp-6.3.0-build",
            "mpfr-4.2.1-build",
            "mpc-1.3.1-build",
            "gcc-13.2.0-bootstrap",
            "musl-1.2.5-build",
            "gcc-13.2.0-final",
            "gdb-14.2-build",
        ]
    );

    // Both gcc passes share one Content Store artifact.
    let gcc: Vec<&str> = stages
        .iter()
        .filter(|s| s.key.package == "gcc")
        .filter_map(|s| s.request.as_ref())
        .map(|r| r.filename.as_str())
        .collect();
    assert_eq!(gcc, ["gcc-13.2.0.tar.xz", "gcc-13.2.0.tar.xz"]);

    for s in &stages {
        let req = s.request.as_ref().expect("every stage has a source");
        assert!(matches!(req.mode, RetrievalMode::Download { .. }), "{}", s.id());
        assert!(!s.phases.is_empty());
    }
}

#[test]
fn base_settings_come_through_extends() {
    let def = config::load(&configs_dir().join("x86_64-linux-musl.toml")).expect("load");
    let ctx = BuildContext::resolve(&def, &Overrides::default(), |_| None).expect("ctx");
    let root = workspace::absolute(&configs_dir().join("..")).expect("root");
    assert!(!root.components().any(|c| c == std::path::Component::ParentDir));
    assert_eq!(ctx.cache_dir(), root.join("cache"));
    assert_eq!(ctx.prefix(), root.join("output"));
    assert_eq!(
        def.lookup("publish.name").and_then(|v| v.as_str()),
        Some("{name}-{target}")
    );
}
