use crate::resource::{XaError, XaHandle, same_handle, xa};
use crate::xid::TransactionId;

/// Where an enlisted branch stands with respect to `xa_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    Active,
    Suspended,
    Ended,
    Failed,
}

/// One resource handle participating in a transaction under a branch id.
///
/// A shared enlistment joined the branch of another enlistment on the same
/// resource manager. It is started and ended like any other member but only
/// the unshared member of the group is prepared, committed or rolled back.
pub struct ResourceEnlistment {
    resource: XaHandle,
    xid: TransactionId,
    end_state: EndState,
    shared: bool,
    read_only: bool,
}

impl ResourceEnlistment {
    pub fn new(resource: XaHandle, xid: TransactionId) -> Self {
        Self {
            resource,
            xid,
            end_state: EndState::Active,
            shared: false,
            read_only: false,
        }
    }

    /// An enlistment piggybacking on an existing branch.
    pub fn joined(resource: XaHandle, xid: TransactionId) -> Self {
        Self {
            shared: true,
            ..Self::new(resource, xid)
        }
    }

    pub fn resource(&self) -> &XaHandle {
        &self.resource
    }

    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    pub fn end_state(&self) -> EndState {
        self.end_state
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    /// Whether this enlistment takes part in prepare, commit and rollback.
    pub fn is_driven(&self) -> bool {
        !self.shared && !self.read_only
    }

    pub fn holds(&self, resource: &XaHandle) -> bool {
        same_handle(&self.resource, resource)
    }

    /// Associates the branch with the resource again, e.g. with `TMRESUME`
    /// or `TMJOIN`.
    pub fn start(&mut self, flags: i32) -> Result<(), XaError> {
        self.resource.start(&self.xid, flags)?;
        self.end_state = EndState::Active;
        Ok(())
    }

    /// Dissociates the branch from the resource.
    ///
    /// A failing `xa_end` leaves the enlistment in the failed state.
    pub fn end(&mut self, flags: i32) -> Result<(), XaError> {
        if let Err(err) = self.resource.end(&self.xid, flags) {
            self.end_state = EndState::Failed;
            return Err(err);
        }
        self.end_state = match flags {
            xa::TMSUSPEND => EndState::Suspended,
            xa::TMFAIL => EndState::Failed,
            _ => EndState::Ended,
        };
        Ok(())
    }

    /// Ends an active or suspended branch before completion. Branches that
    /// already ended, successfully or not, are left alone.
    pub fn finish(&mut self, success: bool) -> Result<(), XaError> {
        match self.end_state {
            EndState::Ended | EndState::Failed => Ok(()),
            EndState::Active | EndState::Suspended => {
                self.end(if success { xa::TMSUCCESS } else { xa::TMFAIL })
            }
        }
    }
}

impl std::fmt::Debug for ResourceEnlistment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEnlistment")
            .field("xid", &self.xid)
            .field("end_state", &self.end_state)
            .field("shared", &self.shared)
            .field("read_only", &self.read_only)
            .finish()
    }
}
