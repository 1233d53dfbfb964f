//! Access to the bootstrap stack shared by every later stage.

use std::collections::BTreeMap;

use stackverify_core::{KeyedStacks, StackDefinition, VerifyContext, VerifyResult};

/// Output of the bootstrap stack naming the remote state bucket.
pub const STATE_BUCKET_OUTPUT: &str = "state_bucket";

/// Backend configuration (`bucket = <state_bucket>`) for stages that keep
/// their state in the bootstrap bucket.
///
/// The bootstrap stack is attached through the context's cache, so every
/// suite in a run shares one read of its outputs.
pub async fn backend_config(ctx: &VerifyContext) -> VerifyResult<BTreeMap<String, String>> {
    let bootstrap = ctx.attach(&ctx.config.stages.bootstrap).await?;
    let bucket = bootstrap.string_output(STATE_BUCKET_OUTPUT)?;
    Ok(BTreeMap::from([("bucket".to_string(), bucket)]))
}

/// Definition of one environment's multitenant stack. Every suite builds
/// it here so the stack cache sees a single definition per id.
pub fn multitenant_definition(
    ctx: &VerifyContext,
    env: &str,
    backend: &BTreeMap<String, String>,
) -> StackDefinition {
    ctx.definition(&ctx.config.stages.multitenant_dir(env))
        .backend(backend)
}

/// Multitenant stacks of every configured environment, keyed by env name.
pub fn multitenant_stacks(ctx: &VerifyContext, backend: &BTreeMap<String, String>) -> KeyedStacks {
    let definitions = ctx
        .config
        .env_names
        .iter()
        .map(|env| (env.clone(), multitenant_definition(ctx, env, backend)))
        .collect();
    ctx.stacks.keyed(definitions)
}
