//! Binding protocol
//!
//! A bind moves a source from unbound to bound by claiming one routing
//! table slot. The source's own state word is claimed first, so a source
//! can be in at most one bind at a time; the table slot is then claimed with
//! a compare-and-swap, so a VIRQ number has at most one occupant.

use alloc::sync::Arc;

use crate::sync::Rcu;
use crate::vic::source::{Binding, SyncClaim, Target};
use crate::vic::{SourceCore, Vic, VirqNumber, VirqSource, VirqTrigger};
use crate::vmm::Vcpu;
use crate::{Error, Result};

/// Run a bind: claim the source, then let `claim_slot` claim a table slot
fn claim<F>(source: &VirqSource, claim_slot: F) -> Result<()>
where
    F: FnOnce(&Arc<SourceCore>) -> Result<Binding>,
{
    let core = source.core();
    if !core.begin_claim() {
        return Err(Error::VirqBound);
    }

    match claim_slot(core) {
        Ok(binding) => {
            log::debug!("vic: VIRQ {} bound (trigger {})", binding.virq, binding.trigger.raw());
            core.finish_claim(Some(binding));
            Ok(())
        }
        Err(e) => {
            core.finish_claim(None);
            Err(e)
        }
    }
}

/// Bind `source` to shared VIRQ `virq` on `vic`
pub fn bind_shared(
    source: &VirqSource,
    vic: &Arc<Vic>,
    virq: VirqNumber,
    trigger: VirqTrigger,
) -> Result<()> {
    claim(source, |core| {
        if !vic.manager().config().is_shared(virq) {
            log::warn!("vic: VIRQ {} outside shared range", virq);
            return Err(Error::ArgumentInvalid);
        }
        core.adopt_manager(vic.manager())?;
        vic.shared.claim(virq, core)?;

        Ok(Binding {
            virq,
            trigger,
            target: Target::Shared {
                vic: Arc::downgrade(vic),
            },
        })
    })
}

/// Bind `source` to private VIRQ `virq` on `vcpu`
pub fn bind_private_vcpu(
    source: &VirqSource,
    vcpu: &Arc<Vcpu>,
    virq: VirqNumber,
    trigger: VirqTrigger,
) -> Result<()> {
    claim(source, |core| {
        if !vcpu.manager().config().is_private(virq) {
            log::warn!("vic: VIRQ {} outside private range", virq);
            return Err(Error::ArgumentInvalid);
        }
        core.adopt_manager(vcpu.manager())?;
        vcpu.private.claim(virq, core)?;

        Ok(Binding {
            virq,
            trigger,
            target: Target::Private {
                vcpu: Arc::downgrade(vcpu),
            },
        })
    })
}

/// Bind `source` to private VIRQ `virq` on the VCPU attached to `vic` at
/// `index`
///
/// Fails with `ObjectConfig` if no VCPU is attached at `index`. The VCPU is
/// resolved once; a later detach does not move the binding.
pub fn bind_private_index(
    source: &VirqSource,
    vic: &Arc<Vic>,
    index: usize,
    virq: VirqNumber,
    trigger: VirqTrigger,
) -> Result<()> {
    claim(source, |core| {
        if !vic.manager().config().is_private(virq) {
            log::warn!("vic: VIRQ {} outside private range", virq);
            return Err(Error::ArgumentInvalid);
        }
        core.adopt_manager(vic.manager())?;

        // Attachments cannot change until the claim is made
        vic.with_attached(index, |vcpu| {
            let vcpu = vcpu.ok_or(Error::ObjectConfig)?;
            vcpu.private.claim(virq, core)?;

            Ok(Binding {
                virq,
                trigger,
                target: Target::Private {
                    vcpu: Arc::downgrade(&vcpu),
                },
            })
        })
    })
}

/// Release the table slot held by `core`
fn release(core: &Arc<SourceCore>, binding: &Binding, rcu: &Rcu) {
    match &binding.target {
        Target::Shared { vic } => {
            if let Some(vic) = vic.upgrade() {
                vic.shared.release(binding.virq, core, rcu);
            }
        }
        Target::Private { vcpu } => {
            if let Some(vcpu) = vcpu.upgrade() {
                vcpu.private.release(binding.virq, core, rcu);
            }
        }
    }
}

fn unbind_core(core: &Arc<SourceCore>) {
    if !core.begin_unbind() {
        return;
    }

    // SAFETY: the source is releasing
    let binding = unsafe { core.binding_unprotected() };
    if let (Some(binding), Some(manager)) = (binding, core.manager()) {
        release(core, &binding, manager.rcu());
        log::debug!("vic: VIRQ {} unbound", binding.virq);
    }
    core.finish_unbind();
}

/// Unbind `source` without waiting
///
/// No new assertion or lookup can find the source once this returns, but a
/// delivery already in flight on a remote CPU may still reach the guest.
/// Does nothing unless the source is bound.
pub fn unbind(source: &VirqSource) {
    unbind_core(source.core());
}

/// Target VCPU the source may currently be delivering to
fn delivery_target(core: &SourceCore, binding: &Binding) -> Option<Arc<Vcpu>> {
    match &binding.target {
        Target::Private { vcpu } => vcpu.upgrade(),
        Target::Shared { vic } => {
            let vic = vic.upgrade()?;
            let index = core.route()?;
            vic.with_attached(index, |vcpu| vcpu)
        }
    }
}

/// Unbind `source` and wait until it can be bound again
///
/// Kicks the target VCPU out of the guest if it is running and waits for a
/// grace period, after which no CPU can still be delivering the source.
/// Concurrent callers all return once the source is reusable.
/// Must not be called from a read-side critical section or with a spinlock
/// held.
pub fn unbind_sync(source: &VirqSource) {
    let core = source.core();
    loop {
        match core.begin_sync() {
            SyncClaim::Owned => break,
            SyncClaim::Bound => unbind_core(core),
            SyncClaim::Releasing => core::hint::spin_loop(),
            SyncClaim::Syncing => {
                core.wait_sync();
                return;
            }
            SyncClaim::Unbound => return,
        }
    }

    let Some(manager) = core.manager() else {
        panic!("vic: unbinding source has no interrupt manager");
    };
    // SAFETY: this caller owns the teardown
    let binding = unsafe { core.binding_unprotected() };
    if let Some(binding) = &binding {
        if let Some(vcpu) = delivery_target(core, binding) {
            if vcpu.running_on().is_some() {
                manager.scheduler().wake(&vcpu);
            }
        }
    }
    manager.rcu().synchronize();

    core.finish_sync(manager.rcu());
    if let Some(binding) = binding {
        log::debug!("vic: VIRQ {} released", binding.virq);
    }
}
