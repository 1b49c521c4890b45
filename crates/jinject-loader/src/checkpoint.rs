//! Method-entry checkpoints in the Android application startup sequence.

use jinject_jdwp::{
    wire::{JdwpError, ThreadId},
    BreakpointHit, DebugSession,
};
use tokio_util::sync::CancellationToken;

/// Whether failing to reach a checkpoint ends the injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointPolicy {
    Optional,
    Mandatory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: &'static str,
    pub class_signature: &'static str,
    pub method_name: &'static str,
    pub method_signature: &'static str,
    pub policy: CheckpointPolicy,
}

impl Checkpoint {
    /// `ApplicationLoaders.getClassLoader`, where the app's class loader (and
    /// with it the native library search path used by the Vulkan loader) is
    /// created.
    pub const VULKAN_LOAD: Checkpoint = Checkpoint {
        name: "ApplicationLoaders.getClassLoader()",
        class_signature: "Landroid/app/ApplicationLoaders;",
        method_name: "getClassLoader",
        method_signature: "(Ljava/lang/String;IZLjava/lang/String;Ljava/lang/String;Ljava/lang/ClassLoader;)Ljava/lang/ClassLoader;",
        policy: CheckpointPolicy::Optional,
    };

    /// `Application.onCreate`, the last point before app code runs.
    pub const ON_CREATE: Checkpoint = Checkpoint {
        name: "Application.onCreate()",
        class_signature: "Landroid/app/Application;",
        method_name: "onCreate",
        method_signature: "()V",
        policy: CheckpointPolicy::Mandatory,
    };
}

#[derive(Debug)]
pub enum CheckpointOutcome {
    Hit(BreakpointHit),
    /// The target does not expose the checkpoint's class or method.
    Unsupported(JdwpError),
}

/// Resolves `checkpoint` and blocks until it is entered, on `thread_filter`
/// when given. The VM is left suspended at the hit.
///
/// Resolution failures are reported as [`CheckpointOutcome::Unsupported`];
/// applying the checkpoint's policy is up to the caller.
pub async fn wait_for_checkpoint(
    session: &DebugSession,
    checkpoint: &Checkpoint,
    thread_filter: Option<ThreadId>,
    cancel: &CancellationToken,
) -> Result<CheckpointOutcome, JdwpError> {
    let method = async {
        let class = session.resolve_class(checkpoint.class_signature).await?;
        session
            .resolve_method(&class, checkpoint.method_name, Some(checkpoint.method_signature))
            .await
    };
    let method = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(JdwpError::Cancelled),
        method = method => method,
    };
    let method = match method {
        Ok(method) => method,
        Err(err) if err.is_resolution() => {
            tracing::debug!(
                target: "jinject.loader",
                checkpoint = checkpoint.name,
                error = %err,
                "checkpoint not available in target"
            );
            return Ok(CheckpointOutcome::Unsupported(err));
        }
        Err(err) => return Err(err),
    };

    let hit = session
        .await_method_entry(&method, thread_filter, cancel)
        .await?;
    tracing::debug!(
        target: "jinject.loader",
        checkpoint = checkpoint.name,
        thread = hit.thread,
        "checkpoint hit"
    );
    Ok(CheckpointOutcome::Hit(hit))
}

/// Waits for the class loader of the application to be created.
pub async fn wait_for_vulkan_load(
    session: &DebugSession,
    cancel: &CancellationToken,
) -> Result<CheckpointOutcome, JdwpError> {
    wait_for_checkpoint(session, &Checkpoint::VULKAN_LOAD, None, cancel).await
}

/// Waits for `Application.onCreate`, on `thread` when known.
pub async fn wait_for_on_create(
    session: &DebugSession,
    thread: Option<ThreadId>,
    cancel: &CancellationToken,
) -> Result<CheckpointOutcome, JdwpError> {
    wait_for_checkpoint(session, &Checkpoint::ON_CREATE, thread, cancel).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jinject_jdwp::{
        wire::mock::{MockEventModifier, MockVm, MockVmConfig},
        JdwpClientConfig,
    };

    use super::*;

    async fn session(config: MockVmConfig) -> (MockVm, DebugSession) {
        let vm = MockVm::spawn_with_config(config).await.unwrap();
        let session = DebugSession::connect(vm.addr(), JdwpClientConfig::default())
            .await
            .unwrap();
        (vm, session)
    }

    #[tokio::test]
    async fn both_checkpoints_hit_in_startup_order() {
        let (vm, session) = session(MockVmConfig::default()).await;
        let cancel = CancellationToken::new();

        let CheckpointOutcome::Hit(early) = wait_for_vulkan_load(&session, &cancel).await.unwrap()
        else {
            panic!("getClassLoader should be reached");
        };
        assert_eq!(early.thread, MockVm::MAIN_THREAD);
        assert!(session.active_requests().is_empty());

        let CheckpointOutcome::Hit(on_create) =
            wait_for_on_create(&session, Some(early.thread), &cancel)
                .await
                .unwrap()
        else {
            panic!("onCreate should be reached");
        };
        assert_eq!(on_create.thread, early.thread);
        assert_ne!(on_create.location.method_id, early.location.method_id);
        assert!(session.active_requests().is_empty());
        assert!(vm.event_requests().await.is_empty());
        assert_eq!(vm.cleared_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn thread_filter_is_sent_with_the_request() {
        let (vm, session) = session(MockVmConfig {
            reaches_on_create: false,
            ..MockVmConfig::default()
        })
        .await;
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            async move { wait_for_on_create(&session, Some(MockVm::MAIN_THREAD), &cancel).await }
        };
        let (result, requests) = tokio::join!(waiter, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let requests = vm.event_requests().await;
            cancel.cancel();
            requests
        });

        assert!(matches!(result, Err(JdwpError::Cancelled)), "{result:?}");
        assert_eq!(requests.len(), 1);
        assert!(requests[0]
            .modifiers
            .contains(&MockEventModifier::ThreadOnly {
                thread: MockVm::MAIN_THREAD
            }));
        assert!(vm.event_requests().await.is_empty());
    }

    #[tokio::test]
    async fn missing_class_is_unsupported() {
        let (vm, session) = session(MockVmConfig {
            has_application_loaders: false,
            ..MockVmConfig::default()
        })
        .await;

        let outcome = wait_for_vulkan_load(&session, &CancellationToken::new())
            .await
            .unwrap();
        assert!(
            matches!(
                &outcome,
                CheckpointOutcome::Unsupported(JdwpError::ClassNotFound { signature })
                    if signature == "Landroid/app/ApplicationLoaders;"
            ),
            "{outcome:?}"
        );
        // Nothing was set, so the VM never ran.
        assert_eq!(vm.resume_calls(), 0);
        assert!(vm.event_requests().await.is_empty());
    }

    #[test]
    fn policies_match_the_startup_roles() {
        assert_eq!(Checkpoint::VULKAN_LOAD.policy, CheckpointPolicy::Optional);
        assert_eq!(Checkpoint::ON_CREATE.policy, CheckpointPolicy::Mandatory);
    }
}
