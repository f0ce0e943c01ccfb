//! Per-port state shared between the control thread and the cycle thread

use crate::backend::BackendPortId;
use crate::types::{ClientKey, PortDirection, PortKind, PortSpec};

/// One registered port.
///
/// Everything here is fixed at registration, so lookups from the cycle thread
/// need no synchronization beyond the registry snapshot that carries them.
pub(crate) struct PortShared {
    client: ClientKey,
    name: String,
    kind: PortKind,
    direction: PortDirection,
    record_size: usize,
    backend_id: BackendPortId,
}

impl PortShared {
    pub(crate) fn new(client: ClientKey, spec: &PortSpec, backend_id: BackendPortId) -> Self {
        Self {
            client,
            name: spec.name.clone(),
            kind: spec.kind,
            direction: spec.direction,
            // Custom buffers are addressed in records; never divide by zero
            record_size: match spec.kind {
                PortKind::Custom => spec.record_size.max(1),
                _ => spec.record_size,
            },
            backend_id,
        }
    }

    pub(crate) fn client(&self) -> ClientKey {
        self.client
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> PortKind {
        self.kind
    }

    pub(crate) fn direction(&self) -> PortDirection {
        self.direction
    }

    pub(crate) fn record_size(&self) -> usize {
        self.record_size
    }

    pub(crate) fn backend_id(&self) -> BackendPortId {
        self.backend_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_record_size_is_never_zero() {
        let spec = PortSpec {
            record_size: 0,
            ..PortSpec::custom("raw", PortDirection::Output, 16)
        };
        let port = PortShared::new(ClientKey(1), &spec, BackendPortId(9));
        assert_eq!(port.record_size(), 1);
        assert_eq!(port.kind(), PortKind::Custom);
        assert_eq!(port.backend_id(), BackendPortId(9));
    }
}
