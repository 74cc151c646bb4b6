//! Device-resident pool of standard-normal variates, grown lazily and
//! shared by every calculation on a [`crate::context::ComputeContext`].

use crate::error::{Error, Result};
use crate::kernels::{names, variate_pool_source};
use ocl::{Buffer, Context, Device, Event, EventList, Kernel, MemFlags, Program, Queue};

/// MT19937 refills exactly 624 words per twist; the pool only ever grows to
/// a multiple of this.
pub const MT_STATE_WORDS: usize = 624;

enum PoolBuffer {
    Single(Buffer<f32>),
    Double(Buffer<f64>),
}

/// The shared variate pool: one compiled MT19937 program, a 624-word state
/// buffer, and a growable samples buffer. Built lazily on the first
/// `ensure_capacity` call; every call after that either no-ops (capacity
/// already sufficient) or grows monotonically, preserving prior samples at
/// identical indices.
pub(crate) struct VariatePool {
    use_double_precision: bool,
    program: Program,
    state: Buffer<u32>,
    pool: PoolBuffer,
    pool_size: usize,
    seed_event: Option<Event>,
}

impl VariatePool {
    /// Round `demand` up to the next multiple of [`MT_STATE_WORDS`].
    fn align(demand: usize) -> usize {
        if demand == 0 {
            return 0;
        }
        ((demand + MT_STATE_WORDS - 1) / MT_STATE_WORDS) * MT_STATE_WORDS
    }

    /// Build the pool's program and state buffer and enqueue `seedInit`.
    /// Called once, lazily, on the first nonzero `ensure_capacity` demand.
    fn build(
        context: &Context,
        device: Device,
        queue: &Queue,
        use_double_precision: bool,
        rng_seed: u64,
    ) -> Result<Self> {
        let src = variate_pool_source(use_double_precision);
        let program = Program::builder()
            .src(src)
            .devices(device)
            .cmplr_opt("-cl-std=CL1.2")
            .build(context)
            .map_err(Error::DeviceOp)?;

        let state = Buffer::<u32>::builder()
            .queue(queue.clone())
            .flags(MemFlags::new().read_write())
            .len(MT_STATE_WORDS)
            .build()?;

        let seed_kernel = Kernel::builder()
            .program(&program)
            .name(names::SEED_INIT)
            .queue(queue.clone())
            .global_work_size(1)
            .arg(rng_seed)
            .arg(&state)
            .build()?;

        let mut seed_event = Event::empty();
        unsafe {
            seed_kernel.cmd().enew(&mut seed_event).enq()?;
        }

        let pool = if use_double_precision {
            PoolBuffer::Double(
                Buffer::<f64>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_write())
                    .len(1)
                    .build()?,
            )
        } else {
            PoolBuffer::Single(
                Buffer::<f32>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_write())
                    .len(1)
                    .build()?,
            )
        };

        Ok(Self {
            use_double_precision,
            program,
            state,
            pool,
            pool_size: 0,
            seed_event: Some(seed_event),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn use_double_precision(&self) -> bool {
        self.use_double_precision
    }

    /// The `rn` kernel argument buffer for a calculation, resolved per
    /// precision. Panics if the precision does not match the pool's — callers
    /// must check [`VariatePool::use_double_precision`] first.
    pub fn single_buffer(&self) -> &Buffer<f32> {
        match &self.pool {
            PoolBuffer::Single(b) => b,
            PoolBuffer::Double(_) => panic!("variate pool precision mismatch"),
        }
    }

    pub fn double_buffer(&self) -> &Buffer<f64> {
        match &self.pool {
            PoolBuffer::Double(b) => b,
            PoolBuffer::Single(_) => panic!("variate pool precision mismatch"),
        }
    }

    /// Ensure the pool holds at least `demand` samples, building it on first
    /// use and growing it (preserving prior samples) otherwise. `demand = 0`
    /// never touches the device at all.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure_capacity(
        pool: &mut Option<VariatePool>,
        context: &Context,
        device: Device,
        queue: &Queue,
        use_double_precision: bool,
        rng_seed: u64,
        demand: usize,
    ) -> Result<()> {
        if demand == 0 {
            return Ok(());
        }

        if pool.is_none() {
            *pool = Some(Self::build(context, device, queue, use_double_precision, rng_seed)?);
        }
        let this = pool.as_mut().expect("just built");

        if this.use_double_precision != use_double_precision {
            return Err(Error::BadState {
                call: "createInputVariates",
                state: "variate pool already built for the other precision",
            });
        }

        if this.pool_size >= demand {
            if let Some(ev) = this.seed_event.take() {
                ev.wait_for()?;
            }
            return Ok(());
        }

        this.grow(queue, demand)
    }

    fn grow(&mut self, queue: &Queue, demand: usize) -> Result<()> {
        let aligned = Self::align(demand);
        let old_size = self.pool_size;

        let mut copy_event = None;
        self.pool = match (&self.pool, self.use_double_precision) {
            (PoolBuffer::Single(old), false) => {
                let new_buf = Buffer::<f32>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_write())
                    .len(aligned)
                    .build()?;
                if old_size > 0 {
                    let mut ev = Event::empty();
                    unsafe {
                        old.copy(&new_buf, None, Some(old_size))
                            .enew(&mut ev)
                            .enq()?;
                    }
                    copy_event = Some(ev);
                }
                PoolBuffer::Single(new_buf)
            }
            (PoolBuffer::Double(old), true) => {
                let new_buf = Buffer::<f64>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_write())
                    .len(aligned)
                    .build()?;
                if old_size > 0 {
                    let mut ev = Event::empty();
                    unsafe {
                        old.copy(&new_buf, None, Some(old_size))
                            .enew(&mut ev)
                            .enq()?;
                    }
                    copy_event = Some(ev);
                }
                PoolBuffer::Double(new_buf)
            }
            _ => unreachable!("precision checked by caller"),
        };

        let mut last_event = self.seed_event.take();
        let mut cursor = old_size;
        while cursor < demand {
            let twist_kernel = Kernel::builder()
                .program(&self.program)
                .name(names::TWIST)
                .queue(queue.clone())
                .global_work_size(1)
                .arg(&self.state)
                .build()?;

            let mut twist_event = Event::empty();
            unsafe {
                let mut cmd = twist_kernel.cmd().enew(&mut twist_event);
                if let Some(ev) = &last_event {
                    let mut wait_list = EventList::empty();
                    wait_list.push(ev.clone());
                    cmd = cmd.ewait(&wait_list);
                }
                cmd.enq()?;
            }

            let mut generate_event = Event::empty();
            match &self.pool {
                PoolBuffer::Single(buf) => {
                    let kernel = Kernel::builder()
                        .program(&self.program)
                        .name(names::GENERATE)
                        .queue(queue.clone())
                        .global_work_size(MT_STATE_WORDS)
                        .arg(cursor as u32)
                        .arg(&self.state)
                        .arg(buf)
                        .build()?;
                    unsafe {
                        let mut wait_list = EventList::empty();
                        wait_list.push(twist_event.clone());
                        kernel
                            .cmd()
                            .ewait(&wait_list)
                            .enew(&mut generate_event)
                            .enq()?;
                    }
                }
                PoolBuffer::Double(buf) => {
                    let kernel = Kernel::builder()
                        .program(&self.program)
                        .name(names::GENERATE)
                        .queue(queue.clone())
                        .global_work_size(MT_STATE_WORDS)
                        .arg(cursor as u32)
                        .arg(&self.state)
                        .arg(buf)
                        .build()?;
                    unsafe {
                        let mut wait_list = EventList::empty();
                        wait_list.push(twist_event.clone());
                        kernel
                            .cmd()
                            .ewait(&wait_list)
                            .enew(&mut generate_event)
                            .enq()?;
                    }
                }
            }

            last_event = Some(generate_event);
            cursor += MT_STATE_WORDS;
        }

        if let Some(ev) = copy_event {
            ev.wait_for()?;
        }
        if let Some(ev) = last_event {
            ev.wait_for()?;
        }

        self.pool_size = aligned;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::VariatePool;

    #[test]
    fn align_rounds_up_to_624() {
        assert_eq!(VariatePool::align(0), 0);
        assert_eq!(VariatePool::align(1), 624);
        assert_eq!(VariatePool::align(624), 624);
        assert_eq!(VariatePool::align(625), 1248);
        assert_eq!(VariatePool::align(1000), 1248);
    }
}
