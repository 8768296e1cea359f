use std::path::Path;

use kedge_core::context::Context;
use kedge_core::engine::{CliEngine, ContainerEngine};
use kedge_core::fixture::{backend_for, test_mount_volumes, FixtureConfig, TestDatabase};
use kedge_core::process::ProcessRunner;

pub struct TestOptions {
    pub force_recreate_database: bool,
    pub force_migrate_database: bool,
    pub tag: Option<String>,
    pub test_options: Vec<String>,
}

pub fn run(root: &Path, opts: TestOptions) -> anyhow::Result<()> {
    let context = Context::load(root)?;
    let engine = CliEngine::new(ProcessRunner::new(&context));

    let is_development = context.get_str("KEDGE_MODE") == Some("development");
    let tag = opts
        .tag
        .as_deref()
        .unwrap_or(if is_development { "dev" } else { "latest" });
    let image = tested_image(&context, tag)?;

    // Source mounts are a development-mode convenience; released images
    // run tests against their baked-in sources.
    let volumes = if is_development {
        test_mount_volumes(&context, root, context.require_str("DOCKER_IMAGE_NAME")?)?
    } else {
        Vec::new()
    };

    if context.get_bool("TESTS_WITH_DATABASE") {
        let backend = backend_for(context.get_str("TEST_DATABASE_TYPE"));
        let mut config = FixtureConfig::from_context(
            &context,
            &image,
            tag,
            is_development,
            opts.force_recreate_database,
            opts.force_migrate_database,
        )?;
        config.volumes = volumes.clone();
        TestDatabase::new(&engine, backend, config).scope(|db| {
            run_tests(
                &engine,
                &context,
                &image,
                &db.network(),
                &volumes,
                &opts.test_options,
            )
        })?;
    } else {
        run_tests(&engine, &context, &image, "none", &volumes, &opts.test_options)?;
    }
    Ok(())
}

/// Tests run inside the image built for this project, addressed as
/// `<registry>/<name>:<tag>`.
fn tested_image(context: &Context, tag: &str) -> kedge_core::Result<String> {
    let registry = context.get_str("DOCKER_REGISTRY_NAME").unwrap_or("docker.io");
    let name = context.require_str("DOCKER_IMAGE_NAME")?;
    Ok(format!("{registry}/{name}:{tag}"))
}

fn run_tests(
    engine: &dyn ContainerEngine,
    context: &Context,
    image: &str,
    network: &str,
    volumes: &[String],
    extra: &[String],
) -> kedge_core::Result<()> {
    tracing::info!("running tests");
    let test_command = context.require_str("TEST_COMMAND")?;
    let mut cmd = vec![test_command];
    cmd.extend(extra.iter().map(String::as_str));
    engine.run_oneshot(network, volumes, image, &cmd)
}
