//! Assertion, clear and sampling
//!
//! The source's pending flag is the authoritative interrupt state. Asserting
//! sets it, picks a target VCPU and sets a hint bit on that VCPU; sampling
//! walks the hint bits and keeps only the VIRQs whose source is still bound,
//! still routed to the sampling VCPU, and still pending.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::sync::RcuReadGuard;
use crate::utils::AtomicBitmap;
use crate::vic::route::RouteRequest;
use crate::vic::source::Target;
use crate::vic::{SourceCore, SourceState, Vic, VirqManager, VirqNumber, VirqSource, VirqTrigger};
use crate::vmm::Vcpu;
use crate::{CpuIndex, Error, Result};

/// Maximum number of VIRQs returned by one sample
pub const MAX_DELIVERY: usize = 64;

/// VIRQs collected for injection
pub type VirqVec = heapless::Vec<VirqNumber, MAX_DELIVERY>;

/// Hint `vcpu` about `virq` in `hints` and wake it on the first hint
fn notify(manager: &VirqManager, vcpu: &Arc<Vcpu>, hints: &AtomicBitmap, virq: VirqNumber) {
    if !hints.set(virq as usize) {
        manager.scheduler().wake(vcpu);
    }
}

/// Pick the attachment index a shared VIRQ is delivered to
fn route_shared(
    vic: &Vic,
    source: &SourceCore,
    virq: VirqNumber,
    pcpu: CpuIndex,
    was_pending: bool,
    guard: &RcuReadGuard<'_>,
) -> Option<(usize, Arc<Vcpu>)> {
    let previous = source.route();

    // A pending VIRQ stays where it was routed while that VCPU is attached
    if was_pending {
        if let Some(index) = previous {
            if let Some(vcpu) = vic.attached_vcpu(index, guard) {
                return Some((index, vcpu));
            }
        }
    }

    let request = RouteRequest {
        virq,
        pcpu,
        affinity: source.affinity(),
        previous,
    };
    let index = vic.route_policy(guard)?.select(vic, &request, guard)?;
    let vcpu = vic.attached_vcpu(index, guard)?;
    Some((index, vcpu))
}

/// Assert `source` from physical CPU `pcpu`
///
/// Returns whether the source was already pending. Fails with
/// `VirqNotBound` unless the source is bound to a live target, and with
/// `ArgumentInvalid` if `pcpu` is not a known CPU. Takes no locks.
pub fn assert(source: &VirqSource, pcpu: CpuIndex) -> Result<bool> {
    let core = source.core();
    let manager = core.manager().ok_or(Error::VirqNotBound)?;
    let guard = manager.rcu().try_read_lock(pcpu).ok_or(Error::ArgumentInvalid)?;

    // An unbind_sync that raced us waits for this read section to end
    if !core.is_bound() {
        return Err(Error::VirqNotBound);
    }
    let binding = core.binding(&guard).ok_or(Error::VirqNotBound)?;

    let virq = binding.virq;
    match &binding.target {
        Target::Private { vcpu } => {
            let vcpu = vcpu.upgrade().ok_or(Error::VirqNotBound)?;
            let was_pending = core.pending_flag().swap(true, Ordering::SeqCst);
            notify(manager, &vcpu, &vcpu.private_hints, virq);
            log::trace!("vic: VIRQ {} asserted on VCPU {}", virq, vcpu.id());
            Ok(was_pending)
        }
        Target::Shared { vic } => {
            let vic = vic.upgrade().ok_or(Error::VirqNotBound)?;
            let was_pending = core.pending_flag().swap(true, Ordering::SeqCst);
            match route_shared(&vic, core, virq, pcpu, was_pending, &guard) {
                Some((index, vcpu)) => {
                    core.route_slot().store(index, Ordering::SeqCst);
                    notify(manager, &vcpu, &vcpu.shared_hints, virq);
                    log::trace!("vic: VIRQ {} routed to index {}", virq, index);
                }
                None => log::trace!("vic: VIRQ {} pending with no target", virq),
            }
            Ok(was_pending)
        }
    }
}

/// Clear `source`'s pending state
///
/// Returns whether it was pending. A delivery already in flight on a remote
/// CPU is not cancelled.
pub fn clear(source: &VirqSource) -> Result<bool> {
    match source.state() {
        SourceState::Bound | SourceState::Unbinding => {
            let was_pending = source.pending_flag().swap(false, Ordering::SeqCst);
            log::trace!("vic: VIRQ {:?} cleared", source.virq());
            Ok(was_pending)
        }
        SourceState::Unbound => Err(Error::VirqNotBound),
    }
}

/// Fire the `check_pending` event for `source`
///
/// Returns the handler's view of whether the source is still asserted, or
/// `NoHandler` if nothing is registered for `trigger`.
pub fn check_pending(manager: &VirqManager, source: &SourceCore, trigger: VirqTrigger) -> Result<bool> {
    manager.triggers().dispatch(trigger, source)
}

/// Drain `hints` into `delivered`
///
/// `resolve` maps a hinted VIRQ to the source that currently delivers it
/// to the sampling VCPU.
fn collect<F>(manager: &VirqManager, hints: &AtomicBitmap, delivered: &mut VirqVec, resolve: F)
where
    F: Fn(VirqNumber) -> Option<Arc<SourceCore>>,
{
    for bit in hints.iter() {
        if delivered.is_full() {
            break;
        }
        if !hints.clear(bit) {
            continue;
        }

        let virq = bit as VirqNumber;
        let Some(source) = resolve(virq).filter(|s| s.is_bound() && s.is_pending()) else {
            continue;
        };
        let Some(trigger) = source.trigger() else {
            continue;
        };

        let deliver = match check_pending(manager, &source, trigger) {
            Ok(true) => {
                // Still asserted: keep it in front of the VCPU
                hints.set(bit);
                true
            }
            Ok(false) => {
                source.pending_flag().store(false, Ordering::SeqCst);
                false
            }
            Err(_) => source.pending_flag().swap(false, Ordering::SeqCst),
        };

        if deliver {
            // Capacity checked at the top of the loop
            let _ = delivered.push(virq);
        }
    }
}

/// Collect the VIRQs to inject into `vcpu`
///
/// Stale hints are dropped. Sources without a `check_pending` handler are
/// edge-triggered and consumed; sources with one stay pending while the
/// handler reports them asserted. Private VIRQs come before shared ones.
pub(crate) fn sample_pending(vcpu: &Arc<Vcpu>, pcpu: CpuIndex) -> Result<VirqVec> {
    let manager = vcpu.manager();
    let guard = manager.rcu().try_read_lock(pcpu).ok_or(Error::ArgumentInvalid)?;
    let mut delivered = VirqVec::new();

    collect(manager, &vcpu.private_hints, &mut delivered, |virq| {
        vcpu.private.lookup(virq, &guard)
    });

    let attachment = vcpu.attachment(&guard);
    collect(manager, &vcpu.shared_hints, &mut delivered, |virq| {
        let (vic, index) = attachment.as_ref()?;
        vic.shared
            .lookup(virq, &guard)
            .filter(|source| source.route() == Some(*index))
    });

    drop(guard);
    if !delivered.is_empty() {
        log::trace!("vic: VCPU {} takes {:?}", vcpu.id(), delivered);
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VicConfig;
    use crate::test_util::Fixture;
    use crate::vic::route::{FixedPolicy, VcpuMask};
    use crate::vic::{bind_private_index, bind_private_vcpu, bind_shared, unbind, unbind_sync};
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_assert_requires_binding() {
        let fx = Fixture::new(1);
        let source = VirqSource::detached();
        assert_eq!(assert(&source, 0), Err(Error::VirqNotBound));
        assert_eq!(clear(&source), Err(Error::VirqNotBound));
        assert!(!source.is_pending());
        assert!(!fx.vcpus[0].has_pending());
    }

    #[test]
    fn test_private_isolation() {
        let config = VicConfig {
            private_count: 64,
            shared_base: 64,
            shared_count: 956,
            ..VicConfig::default()
        };
        let fx = Fixture::with_config(config, 2);
        let (a, b) = (&fx.vcpus[0], &fx.vcpus[1]);
        let src_a = VirqSource::detached();
        let src_b = VirqSource::detached();
        bind_private_vcpu(&src_a, a, 42, VirqTrigger::EDGE).unwrap();
        bind_private_index(&src_b, &fx.vic, 1, 42, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&src_a, 0), Ok(false));
        assert!(src_a.is_pending());
        assert!(!src_b.is_pending());
        assert!(!b.has_pending());
        assert!(b.take_pending(1).unwrap().is_empty());

        assert_eq!(a.take_pending(0).unwrap().as_slice(), &[42]);
        // Edge sources are consumed by delivery
        assert!(!src_a.is_pending());
        assert!(a.take_pending(0).unwrap().is_empty());
    }

    #[test]
    fn test_shared_routed_to_one_vcpu() {
        let fx = Fixture::new(3);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 70, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&source, 0), Ok(false));
        let route = source.route().unwrap();

        let mut receivers = 0;
        for (i, vcpu) in fx.vcpus.iter().enumerate() {
            let taken = vcpu.take_pending(i).unwrap();
            if !taken.is_empty() {
                assert_eq!(taken.as_slice(), &[70]);
                assert_eq!(i, route);
                receivers += 1;
            }
        }
        assert_eq!(receivers, 1);
    }

    #[test]
    fn test_clear_before_sample() {
        let fx = Fixture::new(2);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 70, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(clear(&source), Ok(true));
        assert_eq!(clear(&source), Ok(false));
        for (i, vcpu) in fx.vcpus.iter().enumerate() {
            assert!(vcpu.take_pending(i).unwrap().is_empty());
        }
    }

    #[test]
    fn test_assert_coalesces() {
        let fx = Fixture::new(1);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 33, VirqTrigger::EDGE).unwrap();
        fx.vcpus[0].set_blocked();

        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(assert(&source, 0), Ok(true));
        assert_eq!(fx.sched.wake_count(0), 1);
        assert!(fx.vcpus[0].is_runnable());
        assert_eq!(fx.vcpus[0].take_pending(0).unwrap().as_slice(), &[33]);
    }

    #[test]
    fn test_shared_reroutes_after_detach() {
        let fx = Fixture::new(2);
        fx.vic.set_route_policy(Arc::new(FixedPolicy(0)));
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 80, VirqTrigger::EDGE).unwrap();
        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(source.route(), Some(0));

        let old = fx.vic.detach_vcpu(0).unwrap();
        fx.vic.set_route_policy(Arc::new(FixedPolicy(1)));
        assert_eq!(assert(&source, 0), Ok(true));
        assert_eq!(source.route(), Some(1));

        // The old target's hint is stale
        assert!(old.take_pending(0).unwrap().is_empty());
        assert_eq!(fx.vcpus[1].take_pending(1).unwrap().as_slice(), &[80]);
    }

    #[test]
    fn test_shared_affinity() {
        let fx = Fixture::new(4);
        let source = VirqSource::detached();
        source.set_affinity(VcpuMask::from_index(3));
        bind_shared(&source, &fx.vic, 90, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(source.route(), Some(3));
        assert_eq!(fx.vcpus[3].take_pending(3).unwrap().as_slice(), &[90]);
    }

    #[test]
    fn test_shared_with_no_target_stays_pending() {
        let fx = Fixture::new(0);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 90, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&source, 0), Ok(false));
        assert!(source.is_pending());
        assert_eq!(source.route(), None);

        // Attaching a VCPU and re-asserting routes the pending VIRQ
        let vcpu = fx.new_vcpu(0);
        fx.vic.attach_vcpu(0, &vcpu).unwrap();
        assert_eq!(assert(&source, 0), Ok(true));
        assert_eq!(vcpu.take_pending(0).unwrap().as_slice(), &[90]);
    }

    #[test]
    fn test_level_source_resampled() {
        let line = Arc::new(AtomicBool::new(true));
        let level = line.clone();
        let fx = Fixture::with_trigger(1, VirqTrigger::LEVEL, move |_: &SourceCore| {
            level.load(Ordering::SeqCst)
        });
        let vcpu = &fx.vcpus[0];
        let source = VirqSource::detached();
        bind_private_vcpu(&source, vcpu, 27, VirqTrigger::LEVEL).unwrap();

        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(vcpu.take_pending(0).unwrap().as_slice(), &[27]);
        // Still asserted, so delivered again
        assert_eq!(vcpu.take_pending(0).unwrap().as_slice(), &[27]);
        assert!(source.is_pending());

        line.store(false, Ordering::SeqCst);
        assert!(vcpu.take_pending(0).unwrap().is_empty());
        assert!(!source.is_pending());
        assert!(!vcpu.has_pending());
    }

    #[test]
    fn test_check_pending_event() {
        let fx = Fixture::with_trigger(1, VirqTrigger::LEVEL, |s: &SourceCore| s.is_pending());
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 50, VirqTrigger::LEVEL).unwrap();

        assert_eq!(check_pending(&fx.manager, &source, VirqTrigger::LEVEL), Ok(false));
        assert_eq!(assert(&source, 0), Ok(false));
        assert_eq!(check_pending(&fx.manager, &source, VirqTrigger::LEVEL), Ok(true));
        assert_eq!(
            check_pending(&fx.manager, &source, VirqTrigger::EDGE),
            Err(Error::NoHandler)
        );
    }

    #[test]
    fn test_assert_after_unbind() {
        let fx = Fixture::new(1);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 44, VirqTrigger::EDGE).unwrap();
        assert_eq!(assert(&source, 0), Ok(false));
        unbind(&source);

        assert_eq!(assert(&source, 0), Err(Error::VirqNotBound));
        assert_eq!(clear(&source), Ok(false));
        assert!(fx.vcpus[0].take_pending(0).unwrap().is_empty());
    }

    #[test]
    fn test_assert_after_vic_destroyed() {
        let fx = Fixture::new(0);
        let vic = Vic::new(&fx.manager);
        let source = VirqSource::detached();
        bind_shared(&source, &vic, 44, VirqTrigger::EDGE).unwrap();
        drop(vic);

        assert_eq!(assert(&source, 0), Err(Error::VirqNotBound));
        unbind_sync(&source);
        assert_eq!(bind_shared(&source, &fx.vic, 44, VirqTrigger::EDGE), Ok(()));
    }

    #[test]
    fn test_sample_returns_at_most_capacity() {
        let fx = Fixture::new(1);
        let vcpu = &fx.vcpus[0];
        let sources: Vec<VirqSource> = (0..MAX_DELIVERY as u32 + 4)
            .map(|i| {
                let source = VirqSource::detached();
                source.set_affinity(VcpuMask::from_index(0));
                bind_shared(&source, &fx.vic, 100 + i, VirqTrigger::EDGE).unwrap();
                assert_eq!(assert(&source, 0), Ok(false));
                source
            })
            .collect();

        assert_eq!(vcpu.take_pending(0).unwrap().len(), MAX_DELIVERY);
        assert_eq!(vcpu.take_pending(0).unwrap().len(), 4);
        assert!(sources.iter().all(|s| !s.is_pending()));
    }

    #[test]
    fn test_unbind_sync_races_assert() {
        let fx = Fixture::new(2);
        let barrier = Barrier::new(3);
        let source = VirqSource::detached();

        for round in 0..50 {
            let virq = if round % 2 == 0 { 70 } else { 5 };
            if virq == 70 {
                bind_shared(&source, &fx.vic, virq, VirqTrigger::EDGE).unwrap();
            } else {
                bind_private_index(&source, &fx.vic, 1, virq, VirqTrigger::EDGE).unwrap();
            }

            thread::scope(|s| {
                for pcpu in 0..2 {
                    let (fx, barrier, source) = (&fx, &barrier, &source);
                    s.spawn(move || {
                        barrier.wait();
                        for _ in 0..50 {
                            let _ = assert(source, pcpu);
                            let _ = clear(source);
                            let _ = fx.vcpus[pcpu].take_pending(pcpu);
                        }
                    });
                }
                barrier.wait();
                unbind_sync(&source);
            });

            assert_eq!(source.state(), SourceState::Unbound);
            assert!(!source.is_pending());
        }

        // Still reusable after every round
        assert_eq!(bind_shared(&source, &fx.vic, 70, VirqTrigger::EDGE), Ok(()));
    }

    #[test]
    fn test_private_and_shared_share_a_number() {
        let config = VicConfig {
            private_count: 64,
            shared_base: 32,
            shared_count: 988,
            ..VicConfig::default()
        };
        let fx = Fixture::with_config(config, 1);
        fx.vic.set_route_policy(Arc::new(FixedPolicy(0)));
        let private = VirqSource::detached();
        let shared = VirqSource::detached();
        bind_private_vcpu(&private, &fx.vcpus[0], 40, VirqTrigger::EDGE).unwrap();
        bind_shared(&shared, &fx.vic, 40, VirqTrigger::EDGE).unwrap();

        assert_eq!(assert(&shared, 0), Ok(false));
        assert_eq!(fx.vcpus[0].take_pending(0).unwrap().as_slice(), &[40]);
        assert!(!shared.is_pending());

        // Both asserted: each is delivered once
        assert_eq!(assert(&private, 0), Ok(false));
        assert_eq!(assert(&shared, 0), Ok(false));
        assert_eq!(fx.vcpus[0].take_pending(0).unwrap().as_slice(), &[40, 40]);
        assert!(!private.is_pending());
        assert!(!shared.is_pending());
    }

    #[test]
    fn test_unknown_cpu_is_rejected() {
        let fx = Fixture::new(1);
        let source = VirqSource::detached();
        bind_shared(&source, &fx.vic, 70, VirqTrigger::EDGE).unwrap();
        let max_cpus = fx.manager.rcu().max_cpus();

        assert_eq!(assert(&source, max_cpus), Err(Error::ArgumentInvalid));
        assert!(!source.is_pending());
        assert_eq!(fx.vcpus[0].take_pending(max_cpus), Err(Error::ArgumentInvalid));
    }

    #[test]
    fn test_assert_with_held_locks() {
        let fx = Fixture::new(2);
        let shared = VirqSource::detached();
        let private = VirqSource::detached();
        bind_shared(&shared, &fx.vic, 70, VirqTrigger::EDGE).unwrap();
        bind_private_index(&private, &fx.vic, 1, 3, VirqTrigger::EDGE).unwrap();

        // Interrupt context may land while a bind or attach holds the lock
        let taken = fx.vic.with_attached(1, |_| {
            assert_eq!(assert(&shared, 0), Ok(false));
            assert_eq!(assert(&private, 1), Ok(false));
            fx.vcpus[1].take_pending(1).unwrap()
        });
        assert_eq!(taken.as_slice(), &[3]);
    }
}
