use std::path::Path;

use kedge_core::context::Context;
use kedge_core::engine::CliEngine;
use kedge_core::process::{self, ProcessRunner};
use kedge_core::requirements::{RequirementRecord, RequirementsDispatcher};
use kedge_core::secrets::KubectlSecretInstaller;

pub fn run(root: &Path) -> anyhow::Result<()> {
    let context = Context::load(root)?;
    let records = RequirementRecord::list_from_context(&context);
    if records.is_empty() {
        tracing::info!("no development requirements declared");
        return Ok(());
    }
    if !process::is_command_available("docker") {
        anyhow::bail!("docker is required to provision development requirements");
    }

    let runner = ProcessRunner::new(&context);
    let engine = CliEngine::new(runner.clone());
    let installer = KubectlSecretInstaller::new(runner);
    RequirementsDispatcher::new(&engine, &context, root, &installer).dispatch_all(&records)?;
    Ok(())
}
