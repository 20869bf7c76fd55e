use serde_json::Value;

use agent::DrainKind;
use eventlog::Task;
use plan::{Action, Instance, ResourcePool, TargetState, WatchTime};
use store::{DiskRecord, InstanceRecord, VmRecord};
use super::{ErrorKind, Result, ResultExt, UpdateCtx};

// Progress marks reported while a transition walks its pipeline:
// planned -> stopping -> applying -> starting -> watching -> done
const STOPPING: u32 = 20;
const APPLYING: u32 = 40;
const STARTING: u32 = 60;
const WATCHING: u32 = 80;

/// Execute one instance transition end to end
///
/// Idempotent: every step consults the store record and skips work that is
/// already done, so a re-run after a partial failure converges.
pub fn run(
    ctx: &UpdateCtx,
    inst: &Instance,
    pool: &ResourcePool,
    spec: &Value,
    watch: &WatchTime,
    task: &Task,
) -> Result<()> {
    ctx.cancel.check()?;
    debug!("{} transition: {} -> {}", inst.id(), inst.action, inst.target);
    match inst.target {
        TargetState::Detached => detach(ctx, inst, task),
        TargetState::Stopped => stop(ctx, inst, task),
        TargetState::Started => converge(ctx, inst, pool, spec, watch, task),
    }
}

/// Tear down a record that is no longer in the plan
pub fn delete_obsolete(ctx: &UpdateCtx, rec: &InstanceRecord, task: &Task) -> Result<()> {
    ctx.cancel.check()?;
    let label = format!("{}/{}", rec.job, rec.index);
    if let Some(ref vm) = rec.vm_cid {
        task.in_progress(STOPPING);
        ctx.agent.drain(vm, DrainKind::Shutdown)?;
        ctx.agent.stop(vm)?;
        if let Some(ref disk) = rec.disk_cid {
            // last snapshot before the disk loses its VM
            let snap = ctx.cloud.snapshot_disk(disk)?;
            trace!("snapshotted {} as {}", disk, snap);
            ctx.cloud.detach_disk(vm, disk)?;
        }
        ctx.cloud.delete_vm(vm)?;
    }
    let key = (rec.deployment.clone(), rec.job.clone(), rec.index);
    let vm_cid = rec.vm_cid.clone();
    let disk_cid = rec.disk_cid.clone();
    ctx.store.transaction(move |t| {
        t.instances.remove(&key);
        if let Some(ref vm) = vm_cid {
            t.vms.remove(vm);
        }
        if let Some(ref disk) = disk_cid {
            if let Some(d) = t.disks.get_mut(disk) {
                d.attached_to = None; // disks are orphaned, never deleted
            }
        }
        Ok(())
    })?;
    debug!("deleted obsolete instance {}", label);
    Ok(())
}

// drain + stop, retaining VM and disk
fn stop(ctx: &UpdateCtx, inst: &Instance, task: &Task) -> Result<()> {
    if let Some(ref vm) = inst.vm {
        task.in_progress(STOPPING);
        ctx.agent.drain(vm, DrainKind::Update)?;
        ctx.agent.stop(vm)?;
    }
    commit(ctx, inst, inst.vm.clone(), inst.disk.clone())
}

// drain + stop + release the VM; the disk stays bound for reattachment
fn detach(ctx: &UpdateCtx, inst: &Instance, task: &Task) -> Result<()> {
    if let Some(ref vm) = inst.vm {
        task.in_progress(STOPPING);
        ctx.agent.drain(vm, DrainKind::Shutdown)?;
        ctx.agent.stop(vm)?;
        if let Some(ref disk) = inst.disk {
            ctx.cloud.detach_disk(vm, disk)?;
        }
        ctx.cloud.delete_vm(vm)?;
        let cid = vm.clone();
        ctx.store.transaction(move |t| {
            t.vms.remove(&cid);
            Ok(())
        })?;
    }
    commit(ctx, inst, None, inst.disk.clone())
}

// Drive the instance to started: replace or create the VM as classified,
// push the new spec, start, then watch the agent come up.
fn converge(
    ctx: &UpdateCtx,
    inst: &Instance,
    pool: &ResourcePool,
    spec: &Value,
    watch: &WatchTime,
    task: &Task,
) -> Result<()> {
    let mut vm = inst.vm.clone();
    let mut disk = inst.disk.clone();

    if inst.action == Action::Recreate {
        if let Some(cid) = vm.take() {
            task.in_progress(STOPPING);
            ctx.agent.drain(&cid, DrainKind::Shutdown)?;
            ctx.agent.stop(&cid)?;
            if let Some(ref d) = disk {
                let snap = ctx.cloud.snapshot_disk(d)?;
                trace!("snapshotted {} as {}", d, snap);
                ctx.cloud.detach_disk(&cid, d)?;
            }
            ctx.cloud.delete_vm(&cid)?;
            let gone = cid.clone();
            ctx.store.transaction(move |t| {
                t.vms.remove(&gone);
                Ok(())
            })?;
        }
    } else if inst.action == Action::Update {
        if let Some(ref cid) = vm {
            task.in_progress(STOPPING);
            ctx.agent.drain(cid, DrainKind::Update)?;
            ctx.agent.stop(cid)?;
        }
    }

    ctx.cancel.check()?;
    let vm_cid = match vm {
        Some(cid) => cid,
        None => create_vm(ctx, inst, pool)?,
    };

    if inst.persistent_disk > 0 {
        let disk_cid = match disk.clone() {
            Some(d) => d,
            None => {
                let d = ctx
                    .cloud
                    .create_disk(inst.persistent_disk, &json!({}))
                    .chain_err(|| ErrorKind::DiskAttachmentFailed(inst.id()))?;
                disk = Some(d.clone());
                let rec = DiskRecord {
                    cid: d.clone(),
                    deployment: ctx.deployment.clone(),
                    size: inst.persistent_disk,
                    attached_to: None,
                };
                ctx.store.transaction(move |t| {
                    t.disks.insert(rec.cid.clone(), rec);
                    Ok(())
                })?;
                d
            }
        };
        ctx.cloud
            .attach_disk(&vm_cid, &disk_cid)
            .chain_err(|| ErrorKind::DiskAttachmentFailed(inst.id()))?;
        let (vc, dc) = (vm_cid.clone(), disk_cid.clone());
        ctx.store.transaction(move |t| {
            if let Some(d) = t.disks.get_mut(&dc) {
                d.attached_to = Some(vc.clone());
            }
            Ok(())
        })?;
    } else if let Some(ref d) = disk {
        // disk no longer wanted; detach and orphan
        ctx.cloud.detach_disk(&vm_cid, d)?;
        let dc = d.clone();
        ctx.store.transaction(move |t| {
            if let Some(rec) = t.disks.get_mut(&dc) {
                rec.attached_to = None;
            }
            Ok(())
        })?;
        disk = None;
    }

    ctx.cancel.check()?;
    task.in_progress(APPLYING);
    ctx.agent.prepare(&vm_cid, spec)?;
    ctx.agent.apply(&vm_cid, spec)?;

    task.in_progress(STARTING);
    ctx.agent.start(&vm_cid)?;

    task.in_progress(WATCHING);
    await_running(ctx, &vm_cid, watch, &inst.id())?;

    commit(ctx, inst, Some(vm_cid), disk)
}

fn create_vm(ctx: &UpdateCtx, inst: &Instance, pool: &ResourcePool) -> Result<String> {
    let disks: Vec<String> = inst.disk.clone().into_iter().collect();
    let cid = ctx
        .cloud
        .create_vm(&pool.stemcell.id(), &pool.cloud_properties, &inst.networks, &disks)?;
    let rec = VmRecord {
        cid: cid.clone(),
        deployment: ctx.deployment.clone(),
        pool: pool.name.clone(),
        stemcell: pool.stemcell.id(),
        idle: false,
    };
    ctx.store.transaction(move |t| {
        t.vms.insert(rec.cid.clone(), rec);
        Ok(())
    })?;
    Ok(cid)
}

/// Poll the agent for "running" between the min and max of the window
///
/// Sleeps the minimum first, then polls on the configured cadence until the
/// hard deadline; expiry fails the task with `AgentNotReady`.
pub fn await_running(ctx: &UpdateCtx, vm_cid: &str, watch: &WatchTime, label: &str) -> Result<()> {
    let mut waited = watch.min_ms;
    ctx.clock.sleep_ms(watch.min_ms);
    loop {
        ctx.cancel.check()?;
        let state = ctx
            .agent
            .get_state(vm_cid)
            .chain_err(|| ErrorKind::AgentUnreachable(label.to_string()))?;
        if state.running() {
            trace!("{} running after {}ms", label, waited);
            return Ok(());
        }
        if waited >= watch.max_ms {
            return Err(ErrorKind::AgentNotReady(label.to_string(), waited).into());
        }
        let nap = ::std::cmp::min(ctx.poll_ms, watch.max_ms - waited);
        ctx.clock.sleep_ms(nap);
        waited += nap;
    }
}

// Persist the post-transition truth for this instance
fn commit(ctx: &UpdateCtx, inst: &Instance, vm: Option<String>, disk: Option<String>) -> Result<()> {
    let rec = InstanceRecord {
        deployment: ctx.deployment.clone(),
        job: inst.job.clone(),
        index: inst.index,
        state: format!("{}", inst.target),
        vm_cid: vm,
        disk_cid: disk,
        spec_digest: inst.target_digest.clone(),
        networks: inst.networks.clone(),
    };
    ctx.store.transaction(move |t| {
        if let Some(ref cid) = rec.vm_cid {
            if let Some(v) = t.vms.get_mut(cid) {
                v.idle = false; // allocation transfers ownership out of the pool
            }
        }
        t.instances
            .insert((rec.deployment.clone(), rec.job.clone(), rec.index), rec);
        Ok(())
    })
}
