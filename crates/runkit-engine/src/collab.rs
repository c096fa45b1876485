use async_trait::async_trait;
use log::debug;
use runkit_backend::{
    ChangeEvent, ChangeNotifier, DependentEntityStore, EntityRef, MajorVersion, RuntimeError,
    RuntimeKind,
};

/// Collaborators for a standalone manager: no entity pins anything and
/// change notifications only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollaborators;

#[async_trait]
impl DependentEntityStore for NoopCollaborators {
    async fn entities_using(
        &self,
        _kind: RuntimeKind,
        _major: &MajorVersion,
    ) -> Result<Vec<EntityRef>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn clear_reference(
        &self,
        kind: RuntimeKind,
        entity: &EntityRef,
    ) -> Result<(), RuntimeError> {
        debug!("No entity store; ignoring reset of {kind} pin on {}", entity.id);
        Ok(())
    }
}

#[async_trait]
impl ChangeNotifier for NoopCollaborators {
    async fn notify(&self, kind: RuntimeKind, event: ChangeEvent) -> Result<(), RuntimeError> {
        debug!("{kind} change: {event:?}");
        Ok(())
    }

    async fn refresh_shell_integration(&self, kind: RuntimeKind) -> Result<(), RuntimeError> {
        debug!("{kind} shell integration refresh requested");
        Ok(())
    }

    async fn restart_dependents(
        &self,
        kind: RuntimeKind,
        major: &MajorVersion,
    ) -> Result<(), RuntimeError> {
        debug!("{kind} {major} dependents restart requested");
        Ok(())
    }
}
