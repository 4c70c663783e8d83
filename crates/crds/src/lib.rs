//! JetStream CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the JetStream controller.
//! All kinds live in the `jetstream.nats.io/v1beta2` API group and share the
//! same status shape (`conditions` + `observedGeneration`).

pub mod account;
pub mod condition;
pub mod consumer;
pub mod references;
pub mod stream;
pub mod stream_template;

pub use account::*;
pub use condition::*;
pub use consumer::*;
pub use references::*;
pub use stream::*;
pub use stream_template::*;

/// API group shared by every JetStream CRD
pub const API_GROUP: &str = "jetstream.nats.io";

/// Finalizer placed on objects whose broker resources the controller manages
pub const FINALIZER: &str = "jetstream.nats.io/finalizer";

/// Common accessors over the four JetStream kinds.
///
/// Lets the controller handle status, account references and deletion
/// guards without matching on the concrete kind.
pub trait JetStreamResource {
    /// Current status, if the controller has written one
    fn status(&self) -> Option<&ResourceStatus>;

    /// Name of the Account object this resource connects through
    fn account(&self) -> Option<&str>;

    /// Whether broker-side deletion is suppressed for this object
    fn prevent_delete(&self) -> bool {
        false
    }

    /// Whether broker-side updates are suppressed for this object
    fn prevent_update(&self) -> bool {
        false
    }
}

impl JetStreamResource for Account {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn account(&self) -> Option<&str> {
        None
    }
}

impl JetStreamResource for Stream {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn account(&self) -> Option<&str> {
        self.spec.account.as_deref().filter(|a| !a.is_empty())
    }

    fn prevent_delete(&self) -> bool {
        self.spec.prevent_delete
    }

    fn prevent_update(&self) -> bool {
        self.spec.prevent_update
    }
}

impl JetStreamResource for Consumer {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn account(&self) -> Option<&str> {
        self.spec.account.as_deref().filter(|a| !a.is_empty())
    }

    fn prevent_delete(&self) -> bool {
        self.spec.prevent_delete
    }

    fn prevent_update(&self) -> bool {
        self.spec.prevent_update
    }
}

impl JetStreamResource for StreamTemplate {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn account(&self) -> Option<&str> {
        self.spec.account.as_deref().filter(|a| !a.is_empty())
    }

    fn prevent_delete(&self) -> bool {
        self.spec.prevent_delete
    }
}
