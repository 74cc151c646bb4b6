//! The Compute Context state machine: owns one device, drives the build and
//! run phases, and caches compiled kernels across repeated evaluations.

use std::time::{Duration, Instant};

use ocl::{Buffer, Context, Device, Event, Kernel, MemFlags, Platform, Queue};
use qgpu_core::{
    build_kernel_source, emit_rhs, emit_ssa_line, resolve_arg, trim_build_log, ArgRef, CalcId,
    DebugInfo, KernelSignature, Opcode, Settings, VarId, MAX_BUILD_LOG_CHARS,
};

use crate::device_info::{self, DeviceInfo};
use crate::error::{Error, Result};
use crate::pool::VariatePool;
use crate::record::{CalculationRecord, CompiledKernel};

/// Number of `init()` retries before marking the context permanently
/// unhealthy. A compile-time constant so it can be tuned without touching
/// call sites; see [`InitParams`] for the test-only override.
pub const INIT_MAX_ATTEMPTS: u32 = 10;
/// Backoff between `init()` retries.
pub const INIT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Retry parameters for `init()`. Exists so tests can shrink the backoff to
/// zero without touching the production constants, the same "inject the slow
/// part" shape as this codebase's GPU-skipping test helpers.
#[derive(Clone, Copy, Debug)]
pub struct InitParams {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            max_attempts: INIT_MAX_ATTEMPTS,
            backoff: INIT_RETRY_BACKOFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    CreateInput,
    CreateVariates,
    Calc,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::CreateInput => "createInput",
            State::CreateVariates => "createVariates",
            State::Calc => "calc",
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct InputDescriptor {
    is_scalar: bool,
    offset: usize,
}

/// Per-evaluation scratch: reset (in full or in part) by every
/// `initiate_calculation` call. See `ComputeContext::initiate_calculation`
/// for exactly which fields survive a cache hit.
struct Scratch {
    calc_id: CalcId,
    n: usize,
    settings: Settings,
    /// True when this evaluation must (re)build the kernel: either the
    /// calculation is fresh, or its version/precision changed. When false,
    /// `apply_operation` still allocates ids (for a client that replays its
    /// full opcode stream every run) but does not append SSA text, and
    /// `finalize_calculation` skips source assembly entirely.
    recording: bool,
    inputs: Vec<InputDescriptor>,
    input_values: Vec<f64>,
    n_variates: usize,
    next_var_id: u32,
    free_list: Vec<VarId>,
    ssa_lines: Vec<String>,
    outputs: Vec<VarId>,
}

impl Scratch {
    fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn classify(&self, id: VarId) -> ArgRef {
        let idx = id.index();
        if idx < self.n_inputs() {
            let d = self.inputs[idx];
            if d.is_scalar {
                ArgRef::InputScalar { offset: d.offset }
            } else {
                ArgRef::InputVector { offset: d.offset }
            }
        } else if idx < self.n_inputs() + self.n_variates {
            ArgRef::Variate {
                relative_idx: idx - self.n_inputs(),
            }
        } else {
            ArgRef::Intermediate { id }
        }
    }
}

/// An input value as supplied by the client: one scalar, or one vector of
/// exactly `n` elements.
#[derive(Clone, Debug)]
pub enum InputValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Clamp a value into the finite range of the active precision. Single
/// precision clamps to `f32::MAX`/`f32::MIN` (preserving sign) rather than
/// letting an out-of-range `f64` convert to `+-inf`; double precision is a
/// no-op since `f64` already is the wire type.
fn clamp_to_precision(value: f64, use_double_precision: bool) -> f64 {
    if use_double_precision || value.is_nan() {
        return value;
    }
    let max = f32::MAX as f64;
    value.clamp(-max, max)
}

struct Initialized {
    context: Context,
    queue: Queue,
    pool: Option<VariatePool>,
}

/// Nanosecond timings for one run-phase call, folded into the shared
/// [`DebugInfo`] counters by the caller.
struct RunTiming {
    upload_nanos: u64,
    calc_nanos: u64,
    readback_nanos: u64,
}

/// The central state machine: owns one OpenCL device, its command queue,
/// the shared variate pool, and the per-`(id, version)` kernel cache.
///
/// State-changing calls take `&mut self`; single-threaded use from the
/// client's point of view is enforced by ordinary borrow-checking, not a
/// runtime lock (§5).
pub struct ComputeContext {
    name: String,
    platform: Platform,
    device: Device,
    info: DeviceInfo,
    initialized: Option<Initialized>,
    healthy: bool,
    state: State,
    records: Vec<CalculationRecord>,
    scratch: Option<Scratch>,
    debug: DebugInfo,
}

impl ComputeContext {
    pub(crate) fn new(name: String, platform: Platform, device: Device, info: DeviceInfo) -> Self {
        Self {
            name,
            platform,
            device,
            info,
            initialized: None,
            healthy: true,
            state: State::Idle,
            records: Vec::new(),
            scratch: None,
            debug: DebugInfo::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.debug
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.is_some()
    }

    /// Create the OpenCL context and command queue, retrying on failure.
    /// A no-op if already initialized. Marks the context permanently
    /// unhealthy on final failure.
    pub fn init(&mut self) -> Result<()> {
        self.init_with_params(InitParams::default())
    }

    pub(crate) fn init_with_params(&mut self, params: InitParams) -> Result<()> {
        if self.initialized.is_some() {
            return Ok(());
        }
        if !self.healthy {
            return Err(Error::DeviceInit {
                attempts: 0,
                source: ocl::Error::from(ocl::OclCoreError::from("context permanently unhealthy")),
            });
        }

        let mut last_err = None;
        let mut context = None;
        for attempt in 1..=params.max_attempts {
            match Context::builder().platform(self.platform).devices(self.device).build() {
                Ok(c) => {
                    context = Some(c);
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < params.max_attempts {
                        std::thread::sleep(params.backoff);
                    }
                }
            }
        }

        let context = match context {
            Some(c) => c,
            None => {
                self.healthy = false;
                return Err(Error::DeviceInit {
                    attempts: params.max_attempts,
                    source: last_err.expect("loop ran at least once"),
                });
            }
        };

        let queue = match Queue::new(&context, self.device, None) {
            Ok(q) => q,
            Err(e) => {
                self.healthy = false;
                return Err(Error::DeviceOp(e));
            }
        };

        // Refresh device-info type-size probes with this context's live
        // queue, rather than trusting the registry's throwaway probing
        // context (§4.2.1).
        if let Ok(refreshed) = device_info::capture(self.platform, self.device, &context, &queue) {
            self.info = refreshed;
        }

        self.initialized = Some(Initialized {
            context,
            queue,
            pool: None,
        });
        Ok(())
    }

    fn require_init(&self) -> Result<&Initialized> {
        if !self.healthy {
            return Err(Error::DeviceInit {
                attempts: 0,
                source: ocl::Error::from(ocl::OclCoreError::from("context is unhealthy")),
            });
        }
        self.initialized.as_ref().ok_or(Error::BadState {
            call: "*",
            state: "uninitialized",
        })
    }

    fn require_state(&self, call: &'static str, allowed: &[State]) -> Result<()> {
        if !self.healthy {
            return Err(Error::DeviceInit {
                attempts: 0,
                source: ocl::Error::from(ocl::OclCoreError::from("context is unhealthy")),
            });
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::BadState {
                call,
                state: self.state.name(),
            })
        }
    }

    /// `idle -> createInput`. Resolves or allocates the calculation record
    /// and resets per-evaluation scratch.
    pub fn initiate_calculation(
        &mut self,
        n: usize,
        id: u32,
        version: u64,
        settings: Settings,
    ) -> Result<(u32, bool)> {
        self.require_state("initiateCalculation", &[State::Idle])?;
        if n == 0 {
            return Err(Error::BadState {
                call: "initiateCalculation",
                state: "n must be >= 1",
            });
        }

        let (calc_id, fresh) = if CalcId::is_new_request(id) {
            self.records
                .push(CalculationRecord::new(n, version, settings.use_double_precision));
            let calc_id = CalcId((self.records.len()) as u32);
            (calc_id, true)
        } else {
            let calc_id = CalcId(id);
            let slot = calc_id.slot();
            let record = self
                .records
                .get_mut(slot)
                .ok_or(Error::BadId(id))?;
            if record.disposed || record.n != n {
                return Err(Error::BadId(id));
            }

            // A version bump or a precision change both invalidate any
            // cached kernel; the latter is the resolved open question from
            // §9: a precision change is treated as a version bump.
            let precision_changed = record.use_double_precision != settings.use_double_precision;
            let fresh = if version != record.version || precision_changed {
                record.invalidate();
                record.version = version;
                record.use_double_precision = settings.use_double_precision;
                true
            } else {
                !record.has_kernel()
            };
            (calc_id, fresh)
        };

        let recording = fresh;
        let ssa_lines = if recording {
            Vec::new()
        } else {
            self.scratch.take().map(|s| s.ssa_lines).unwrap_or_default()
        };

        self.scratch = Some(Scratch {
            calc_id,
            n,
            settings,
            recording,
            inputs: Vec::new(),
            input_values: Vec::new(),
            n_variates: 0,
            next_var_id: 0,
            free_list: Vec::new(),
            ssa_lines,
            outputs: Vec::new(),
        });
        self.state = State::CreateInput;

        Ok((calc_id.0, fresh))
    }

    fn scratch_mut(&mut self, call: &'static str) -> Result<&mut Scratch> {
        self.scratch.as_mut().ok_or(Error::BadState {
            call,
            state: self.state.name(),
        })
    }

    /// Append a scalar or vector input and return its fresh variable id.
    pub fn create_input_variable(&mut self, value: InputValue) -> Result<VarId> {
        self.require_state("createInputVariable", &[State::CreateInput])?;
        let scratch = self.scratch_mut("createInputVariable")?;

        let is_scalar = matches!(value, InputValue::Scalar(_));
        let use_double = scratch.settings.use_double_precision;
        let offset = scratch
            .inputs
            .last()
            .map(|d| d.offset + if d.is_scalar { 1 } else { scratch.n })
            .unwrap_or(0);

        match value {
            InputValue::Scalar(v) => {
                scratch.input_values.push(clamp_to_precision(v, use_double));
            }
            InputValue::Vector(vs) => {
                if vs.len() != scratch.n {
                    return Err(Error::BadState {
                        call: "createInputVariable",
                        state: "vector input length must equal n",
                    });
                }
                scratch
                    .input_values
                    .extend(vs.into_iter().map(|v| clamp_to_precision(v, use_double)));
            }
        }

        scratch.inputs.push(InputDescriptor { is_scalar, offset });
        let id = VarId(scratch.next_var_id);
        scratch.next_var_id += 1;
        Ok(id)
    }

    /// Allocate `dim * steps` variate ids and grow the shared pool to meet
    /// demand. Forbidden once a kernel already exists for this `(id,
    /// version)` — its layout is already baked in.
    pub fn create_input_variates(&mut self, dim: usize, steps: usize) -> Result<Vec<Vec<VarId>>> {
        self.require_state(
            "createInputVariates",
            &[State::CreateInput, State::CreateVariates],
        )?;

        {
            let calc_id = self.scratch_mut("createInputVariates")?.calc_id;
            let record = &self.records[calc_id.slot()];
            if record.has_kernel() {
                return Err(Error::BadState {
                    call: "createInputVariates",
                    state: "kernel already cached for this (id, version)",
                });
            }
        }

        let count = dim * steps;
        let (n, use_double, seed) = {
            let scratch = self.scratch_mut("createInputVariates")?;
            (scratch.n, scratch.settings.use_double_precision, scratch.settings.rng_seed)
        };

        let mut ids = Vec::with_capacity(dim);
        {
            let scratch = self.scratch_mut("createInputVariates")?;
            for _ in 0..dim {
                let mut row = Vec::with_capacity(steps);
                for _ in 0..steps {
                    row.push(VarId(scratch.next_var_id));
                    scratch.next_var_id += 1;
                }
                ids.push(row);
            }
            scratch.n_variates += count;
        }

        if count > 0 {
            let demand = {
                let scratch = self.scratch.as_ref().expect("just set");
                scratch.n_variates * n
            };
            let initialized = self.initialized.as_mut().ok_or(Error::BadState {
                call: "createInputVariates",
                state: "uninitialized",
            })?;
            VariatePool::ensure_capacity(
                &mut initialized.pool,
                &initialized.context,
                self.device,
                &initialized.queue,
                use_double,
                seed,
                demand,
            )?;
        }

        self.state = State::CreateVariates;
        Ok(ids)
    }

    /// Apply one opcode, given as its stable wire-integer encoding, to
    /// previously-produced variable ids, returning the result's fresh or
    /// recycled id. `opcode` outside the supported range fails with
    /// `UnknownOpcode` before the state machine or scratch is touched.
    pub fn apply_operation(&mut self, opcode: u32, args: &[VarId]) -> Result<VarId> {
        let op = Opcode::try_from(opcode).map_err(Error::UnknownOpcode)?;
        self.apply_operation_typed(op, args)
    }

    fn apply_operation_typed(&mut self, opcode: Opcode, args: &[VarId]) -> Result<VarId> {
        self.require_state(
            "applyOperation",
            &[State::CreateInput, State::CreateVariates, State::Calc],
        )?;
        let scratch = self.scratch_mut("applyOperation")?;

        let resolved: Vec<String> = args.iter().map(|&a| resolve_arg(scratch.classify(a))).collect();
        let rhs = emit_rhs(opcode, &resolved)?;

        let (result_id, recycled) = match scratch.free_list.pop() {
            Some(id) => (id, true),
            None => {
                let id = VarId(scratch.next_var_id);
                scratch.next_var_id += 1;
                (id, false)
            }
        };

        if scratch.recording {
            let float_type = if scratch.settings.use_double_precision {
                "double"
            } else {
                "float"
            };
            let line = emit_ssa_line(float_type, result_id, &rhs, recycled);
            scratch.ssa_lines.push(line);
        }

        self.state = State::Calc;
        Ok(result_id)
    }

    /// Return `id` to the free list for reuse by a later `apply_operation`.
    /// A no-op for input and variate ids. Forbidden once the kernel is
    /// already cached, mirroring `createInputVariates`.
    pub fn free_variable(&mut self, id: VarId) -> Result<()> {
        self.require_state("freeVariable", &[State::Calc])?;

        let calc_id = self.scratch_mut("freeVariable")?.calc_id;
        if self.records[calc_id.slot()].has_kernel() {
            return Err(Error::BadState {
                call: "freeVariable",
                state: "kernel already cached for this (id, version)",
            });
        }

        let scratch = self.scratch_mut("freeVariable")?;
        if id.index() >= scratch.n_inputs() + scratch.n_variates {
            scratch.free_list.push(id);
        }
        Ok(())
    }

    /// Append `id` to the output list. Valid in any non-idle state.
    pub fn declare_output_variable(&mut self, id: VarId) -> Result<()> {
        self.require_state(
            "declareOutputVariable",
            &[State::CreateInput, State::CreateVariates, State::Calc],
        )?;
        self.scratch_mut("declareOutputVariable")?.outputs.push(id);
        Ok(())
    }

    /// Run the Build Phase (on a cache miss) and the Run Phase, writing
    /// results into `outputs`. Unconditionally returns the state machine to
    /// `idle`, even on failure.
    pub fn finalize_calculation(&mut self, outputs: &mut [Vec<f64>]) -> Result<()> {
        let result = self.finalize_calculation_inner(outputs);
        self.state = State::Idle;
        self.scratch = None;
        result
    }

    fn finalize_calculation_inner(&mut self, outputs: &mut [Vec<f64>]) -> Result<()> {
        self.require_state(
            "finalizeCalculation",
            &[State::CreateInput, State::CreateVariates, State::Calc],
        )?;
        let scratch = self.scratch.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "idle",
        })?;

        if outputs.len() != scratch.outputs.len() {
            return Err(Error::OutputArity {
                expected: scratch.outputs.len(),
                got: outputs.len(),
            });
        }

        let use_double = scratch.settings.use_double_precision;
        if use_double && !self.info.supports_double_precision {
            return Err(Error::CapabilityMismatch {
                device: self.name.clone(),
            });
        }

        let debug_enabled = scratch.settings.debug;
        let n = scratch.n;
        let calc_id = scratch.calc_id;
        let n_inputs = scratch.n_inputs();
        let n_outputs = scratch.outputs.len();
        let input_values = scratch.input_values.clone();
        let recording = scratch.recording;

        let initialized = self.initialized.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "uninitialized",
        })?;
        let queue = &initialized.queue;

        let has_input = n_inputs > 0;
        let has_output = n_outputs > 0;
        let has_variates = initialized
            .pool
            .as_ref()
            .map(|p| p.pool_size() > 0)
            .unwrap_or(false)
            && scratch.n_variates > 0;

        // On a cache hit the kernel's argument list was fixed at the
        // recording run; a replay that now has a different buffer shape
        // (e.g. a different number of declared outputs) would bind the
        // wrong number of args to the cached kernel, so check the recomputed
        // signature against the one the kernel was actually built with.
        if !recording {
            let cached_sig = self.records[calc_id.slot()]
                .compiled
                .as_ref()
                .ok_or(Error::BadState {
                    call: "finalizeCalculation",
                    state: "kernel missing after build",
                })?
                .signature;
            let current_sig = KernelSignature {
                has_input,
                has_variates,
                has_output,
            };
            if cached_sig != current_sig {
                return Err(Error::BadState {
                    call: "finalizeCalculation",
                    state: "replayed opcode stream does not match the cached kernel's signature",
                });
            }
        }

        if recording {
            let t_build_start = Instant::now();
            self.build_kernel(scratch_snapshot(scratch), calc_id, has_input, has_variates, has_output)?;
            if debug_enabled {
                queue.finish()?;
                self.debug.add_program_build(t_build_start.elapsed().as_nanos() as u64);
            }
        } else if debug_enabled {
            self.debug.add_program_build(0);
        }

        self.records[calc_id.slot()].n_output_vars = n_outputs;

        // Per-evaluation input/output buffers are allocated fresh every call
        // even when the compiled kernel is cached, so kernel args are bound
        // in positional order `(n, input?, rn?, output?)` immediately before
        // each enqueue rather than once at build time (§4.2.8 steps 3-6).
        let (combined, timing) = if use_double {
            self.run_evaluation_f64(calc_id, n, &input_values, has_input, has_variates, has_output, n_outputs, debug_enabled)?
        } else {
            self.run_evaluation_f32(calc_id, n, &input_values, has_input, has_variates, has_output, n_outputs, debug_enabled)?
        };

        for (idx, out) in outputs.iter_mut().enumerate() {
            out.clear();
            out.extend_from_slice(&combined[idx * n..(idx + 1) * n]);
        }

        if debug_enabled {
            self.debug.add_data_copy(timing.upload_nanos + timing.readback_nanos);
            self.debug.add_calculation(timing.calc_nanos);
            self.debug.add_operations(1);
        }

        Ok(())
    }

    /// Run phase for single precision: upload, bind, enqueue, read back.
    /// Returns the combined `nOutputVars * n` result (widened to `f64` for
    /// the client) and the phase timing for the debug counters.
    fn run_evaluation_f32(
        &self,
        calc_id: CalcId,
        n: usize,
        input_values: &[f64],
        has_input: bool,
        has_variates: bool,
        has_output: bool,
        n_outputs: usize,
        debug_enabled: bool,
    ) -> Result<(Vec<f64>, RunTiming)> {
        let initialized = self.initialized.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "uninitialized",
        })?;
        let queue = &initialized.queue;

        let input_f32: Vec<f32> = input_values.iter().map(|&v| v as f32).collect();
        let input_buf = if has_input {
            Some(
                Buffer::<f32>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_only())
                    .len(input_f32.len().max(1))
                    .build()?,
            )
        } else {
            None
        };

        let t_upload_start = Instant::now();
        let mut input_event = None;
        if let Some(buf) = &input_buf {
            let mut ev = Event::empty();
            unsafe {
                buf.write(&input_f32).enew(&mut ev).enq()?;
            }
            input_event = Some(ev);
        }
        if debug_enabled {
            queue.finish()?;
        }
        let upload_nanos = t_upload_start.elapsed().as_nanos() as u64;

        let record = &self.records[calc_id.slot()];
        let compiled = record.compiled.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "kernel missing after build",
        })?;
        let kernel = &compiled.kernel;

        let mut idx = 0u32;
        kernel.set_arg::<u32, _, _>(idx, n as u32)?;
        idx += 1;
        if has_input {
            let buf = input_buf.as_ref().expect("has_input implies buffer allocated");
            kernel.set_arg::<f32, _, _>(idx, buf)?;
            idx += 1;
        }
        if has_variates {
            let pool = initialized.pool.as_ref().ok_or(Error::BadState {
                call: "finalizeCalculation",
                state: "variate pool missing",
            })?;
            kernel.set_arg::<f32, _, _>(idx, pool.single_buffer())?;
            idx += 1;
        }
        let output_buf = if has_output {
            Some(
                Buffer::<f32>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().write_only())
                    .len((n_outputs * n).max(1))
                    .build()?,
            )
        } else {
            None
        };
        if has_output {
            let buf = output_buf.as_ref().expect("has_output implies buffer allocated");
            kernel.set_arg::<f32, _, _>(idx, buf)?;
        }

        let t_calc_start = Instant::now();
        let mut run_event = Event::empty();
        unsafe {
            let mut cmd = kernel.cmd().global_work_size(n).enew(&mut run_event);
            if let Some(ev) = &input_event {
                cmd = cmd.ewait(ev);
            }
            cmd.enq()?;
        }
        if debug_enabled {
            queue.finish()?;
        }
        let calc_nanos = t_calc_start.elapsed().as_nanos() as u64;

        let t_readback_start = Instant::now();
        let mut combined = vec![0f64; n_outputs * n];
        if let Some(buf) = &output_buf {
            let mut raw = vec![0f32; n_outputs * n];
            buf.read(&mut raw).ewait(&run_event).enq()?;
            for (dst, &src) in combined.iter_mut().zip(raw.iter()) {
                *dst = src as f64;
            }
        }
        let readback_nanos = t_readback_start.elapsed().as_nanos() as u64;

        Ok((
            combined,
            RunTiming {
                upload_nanos,
                calc_nanos,
                readback_nanos,
            },
        ))
    }

    /// Run phase for double precision: the same protocol as
    /// [`Self::run_evaluation_f32`] without the narrowing/widening cast, since
    /// `f64` is already the client-facing wire type.
    fn run_evaluation_f64(
        &self,
        calc_id: CalcId,
        n: usize,
        input_values: &[f64],
        has_input: bool,
        has_variates: bool,
        has_output: bool,
        n_outputs: usize,
        debug_enabled: bool,
    ) -> Result<(Vec<f64>, RunTiming)> {
        let initialized = self.initialized.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "uninitialized",
        })?;
        let queue = &initialized.queue;

        let input_buf = if has_input {
            Some(
                Buffer::<f64>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().read_only())
                    .len(input_values.len().max(1))
                    .build()?,
            )
        } else {
            None
        };

        let t_upload_start = Instant::now();
        let mut input_event = None;
        if let Some(buf) = &input_buf {
            let mut ev = Event::empty();
            unsafe {
                buf.write(input_values).enew(&mut ev).enq()?;
            }
            input_event = Some(ev);
        }
        if debug_enabled {
            queue.finish()?;
        }
        let upload_nanos = t_upload_start.elapsed().as_nanos() as u64;

        let record = &self.records[calc_id.slot()];
        let compiled = record.compiled.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "kernel missing after build",
        })?;
        let kernel = &compiled.kernel;

        let mut idx = 0u32;
        kernel.set_arg::<u32, _, _>(idx, n as u32)?;
        idx += 1;
        if has_input {
            let buf = input_buf.as_ref().expect("has_input implies buffer allocated");
            kernel.set_arg::<f64, _, _>(idx, buf)?;
            idx += 1;
        }
        if has_variates {
            let pool = initialized.pool.as_ref().ok_or(Error::BadState {
                call: "finalizeCalculation",
                state: "variate pool missing",
            })?;
            kernel.set_arg::<f64, _, _>(idx, pool.double_buffer())?;
            idx += 1;
        }
        let output_buf = if has_output {
            Some(
                Buffer::<f64>::builder()
                    .queue(queue.clone())
                    .flags(MemFlags::new().write_only())
                    .len((n_outputs * n).max(1))
                    .build()?,
            )
        } else {
            None
        };
        if has_output {
            let buf = output_buf.as_ref().expect("has_output implies buffer allocated");
            kernel.set_arg::<f64, _, _>(idx, buf)?;
        }

        let t_calc_start = Instant::now();
        let mut run_event = Event::empty();
        unsafe {
            let mut cmd = kernel.cmd().global_work_size(n).enew(&mut run_event);
            if let Some(ev) = &input_event {
                cmd = cmd.ewait(ev);
            }
            cmd.enq()?;
        }
        if debug_enabled {
            queue.finish()?;
        }
        let calc_nanos = t_calc_start.elapsed().as_nanos() as u64;

        let t_readback_start = Instant::now();
        let mut combined = vec![0f64; n_outputs * n];
        if let Some(buf) = &output_buf {
            buf.read(&mut combined).ewait(&run_event).enq()?;
        }
        let readback_nanos = t_readback_start.elapsed().as_nanos() as u64;

        Ok((
            combined,
            RunTiming {
                upload_nanos,
                calc_nanos,
                readback_nanos,
            },
        ))
    }

    fn build_kernel(
        &mut self,
        snapshot: ScratchSnapshot,
        calc_id: CalcId,
        has_input: bool,
        has_variates: bool,
        has_output: bool,
    ) -> Result<()> {
        let initialized = self.initialized.as_ref().ok_or(Error::BadState {
            call: "finalizeCalculation",
            state: "uninitialized",
        })?;

        let sig = KernelSignature {
            has_input,
            has_variates,
            has_output,
        };

        let output_exprs: Vec<String> = snapshot
            .outputs
            .iter()
            .map(|&id| resolve_arg(snapshot.classify(id)))
            .collect();

        let kernel_name = format!("ore_calc_{}", calc_id.0);
        let src = build_kernel_source(
            snapshot.use_double_precision,
            &kernel_name,
            sig,
            &snapshot.ssa_lines.join("\n"),
            &output_exprs,
        );

        let program = ocl::Program::builder()
            .src(src)
            .devices(self.device)
            .cmplr_opt("-cl-std=CL1.2")
            .build(&initialized.context);

        let program = match program {
            Ok(p) => p,
            Err(e) => {
                let log = e.to_string();
                return Err(Error::BuildFailed {
                    log: trim_build_log(&log),
                });
            }
        };

        // `KernelBuilder::build` checks the placeholder arg count against the
        // compiled kernel's actual parameter count, so every parameter needs
        // a stand-in here even though the real values are bound later via
        // `set_arg` on each `finalize_calculation` call (§4.2.8).
        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name(&kernel_name)
            .queue(initialized.queue.clone())
            .arg(0u32);
        if snapshot.use_double_precision {
            if has_input {
                builder.arg(None::<&Buffer<f64>>);
            }
            if has_variates {
                builder.arg(None::<&Buffer<f64>>);
            }
            if has_output {
                builder.arg(None::<&Buffer<f64>>);
            }
        } else {
            if has_input {
                builder.arg(None::<&Buffer<f32>>);
            }
            if has_variates {
                builder.arg(None::<&Buffer<f32>>);
            }
            if has_output {
                builder.arg(None::<&Buffer<f32>>);
            }
        }

        let kernel = builder.build()?;

        self.records[calc_id.slot()].compiled = Some(CompiledKernel {
            program,
            kernel,
            signature: sig,
        });

        Ok(())
    }

    /// Release `(id, version)`'s cached program and kernel. Double disposal
    /// fails with `BadId`.
    pub fn dispose_calculation(&mut self, id: u32) -> Result<()> {
        let calc_id = CalcId(id);
        let record = self
            .records
            .get_mut(calc_id.slot())
            .ok_or(Error::BadId(id))?;
        if record.disposed {
            return Err(Error::BadId(id));
        }
        record.invalidate();
        record.disposed = true;
        Ok(())
    }
}

/// Every OpenCL driver under test here is effectively single-threaded from
/// the host's point of view; running two device-touching tests concurrently
/// has produced spurious driver failures on shared runners. Acquire this
/// before enumerating devices or driving a context in a test.
#[cfg(test)]
pub(crate) fn gpu_test_lock() -> &'static std::sync::Mutex<()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Open and initialise the first registered device, or `None` if no OpenCL
/// platform/device is present, or if the OpenCL library itself panics (e.g.
/// no ICD installed). Use this in tests to skip gracefully without a GPU.
#[cfg(test)]
pub(crate) fn try_ctx() -> Option<ComputeContext> {
    let _guard = gpu_test_lock().lock().unwrap_or_else(|e| e.into_inner());
    let registry = match std::panic::catch_unwind(crate::registry::DeviceRegistry::enumerate) {
        Ok(Ok(r)) => r,
        _ => return None,
    };
    if registry.is_empty() {
        return None;
    }
    let name = registry.names().into_iter().next()?;
    let mut ctx = match registry.open_context(&name) {
        Ok(c) => c,
        Err(_) => return None,
    };
    if ctx.init().is_err() {
        return None;
    }
    Some(ctx)
}

/// Everything `build_kernel` needs from `Scratch`, captured by value so the
/// mutable borrow on `self.records` in `build_kernel` doesn't overlap with
/// the shared borrow on `self.scratch`.
struct ScratchSnapshot {
    use_double_precision: bool,
    ssa_lines: Vec<String>,
    outputs: Vec<VarId>,
    inputs: Vec<InputDescriptor>,
    n_variates: usize,
}

impl ScratchSnapshot {
    fn classify(&self, id: VarId) -> ArgRef {
        let idx = id.index();
        if idx < self.inputs.len() {
            let d = self.inputs[idx];
            if d.is_scalar {
                ArgRef::InputScalar { offset: d.offset }
            } else {
                ArgRef::InputVector { offset: d.offset }
            }
        } else if idx < self.inputs.len() + self.n_variates {
            ArgRef::Variate {
                relative_idx: idx - self.inputs.len(),
            }
        } else {
            ArgRef::Intermediate { id }
        }
    }
}

fn scratch_snapshot(scratch: &Scratch) -> ScratchSnapshot {
    ScratchSnapshot {
        use_double_precision: scratch.settings.use_double_precision,
        ssa_lines: scratch.ssa_lines.clone(),
        outputs: scratch.outputs.clone(),
        inputs: scratch.inputs.clone(),
        n_variates: scratch.n_variates,
    }
}

const _: usize = MAX_BUILD_LOG_CHARS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_to_precision_preserves_double() {
        assert_eq!(clamp_to_precision(1e300, true), 1e300);
        assert!(clamp_to_precision(f64::NAN, true).is_nan());
    }

    #[test]
    fn clamp_to_precision_saturates_single() {
        let max = f32::MAX as f64;
        assert_eq!(clamp_to_precision(1e300, false), max);
        assert_eq!(clamp_to_precision(-1e300, false), -max);
        assert_eq!(clamp_to_precision(1.5, false), 1.5);
        assert!(clamp_to_precision(f64::NAN, false).is_nan());
    }

    #[test]
    fn init_is_idempotent_and_healthy() {
        let Some(mut ctx) = try_ctx() else { return };
        assert!(ctx.is_healthy());
        assert!(ctx.is_initialized());
        let params = InitParams {
            max_attempts: 1,
            backoff: Duration::from_millis(0),
        };
        assert!(ctx.init_with_params(params).is_ok(), "re-init on an already-initialised context is a no-op");
    }

    #[test]
    fn apply_operation_rejects_unknown_opcode() {
        let Some(mut ctx) = try_ctx() else { return };
        ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        let v = ctx.create_input_variable(InputValue::Scalar(1.0)).unwrap();
        let err = ctx.apply_operation(999, &[v]).unwrap_err();
        assert!(matches!(err, Error::UnknownOpcode(999)));
    }

    #[test]
    fn apply_operation_before_create_input_fails() {
        let Some(mut ctx) = try_ctx() else { return };
        let v = VarId(0);
        let err = ctx.apply_operation(Opcode::Add as u32, &[v, v]).unwrap_err();
        assert!(matches!(err, Error::BadState { call: "applyOperation", .. }));
    }

    #[test]
    fn free_variable_recycles_intermediate_id() {
        let Some(mut ctx) = try_ctx() else { return };
        ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        let a = ctx.create_input_variable(InputValue::Scalar(1.0)).unwrap();
        let b = ctx.create_input_variable(InputValue::Scalar(2.0)).unwrap();
        let sum = ctx.apply_operation(Opcode::Add as u32, &[a, b]).unwrap();
        ctx.free_variable(sum).unwrap();
        let doubled = ctx.apply_operation(Opcode::Add as u32, &[a, a]).unwrap();
        assert_eq!(doubled, sum, "freed intermediate id should be recycled immediately");
    }

    #[test]
    fn initiate_calculation_rejects_zero_n() {
        let Some(mut ctx) = try_ctx() else { return };
        let err = ctx.initiate_calculation(0, 0, 1, Settings::default()).unwrap_err();
        assert!(matches!(err, Error::BadState { state: "n must be >= 1", .. }));
    }

    #[test]
    fn initiate_calculation_rejects_mismatched_n_on_reuse() {
        let Some(mut ctx) = try_ctx() else { return };
        let (id, _) = ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        ctx.declare_output_variable(VarId(0)).ok();
        let mut outputs = vec![Vec::new()];
        let _ = ctx.finalize_calculation(&mut outputs);
        let err = ctx.initiate_calculation(8, id, 1, Settings::default()).unwrap_err();
        assert!(matches!(err, Error::BadId(_)));
    }

    #[test]
    fn version_bump_invalidates_cached_kernel() {
        let Some(mut ctx) = try_ctx() else { return };
        let (id, fresh1) = ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        assert!(fresh1);
        let a = ctx.create_input_variable(InputValue::Scalar(2.0)).unwrap();
        ctx.declare_output_variable(a).unwrap();
        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();

        let (_, fresh2) = ctx.initiate_calculation(4, id, 1, Settings::default()).unwrap();
        assert!(!fresh2, "same version should hit the cache");

        let (_, fresh3) = ctx.initiate_calculation(4, id, 2, Settings::default()).unwrap();
        assert!(fresh3, "version bump should force a rebuild");
    }

    #[test]
    fn dispose_calculation_twice_fails() {
        let Some(mut ctx) = try_ctx() else { return };
        let (id, _) = ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        ctx.declare_output_variable(VarId(0)).unwrap();
        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();
        ctx.dispose_calculation(id).unwrap();
        assert!(matches!(ctx.dispose_calculation(id), Err(Error::BadId(_))));
    }

    #[test]
    fn disposed_calculation_rejects_further_operations() {
        let Some(mut ctx) = try_ctx() else { return };
        let (id, _) = ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        ctx.declare_output_variable(VarId(0)).unwrap();
        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();
        ctx.dispose_calculation(id).unwrap();

        // Re-initiating the disposed id is itself a BadId, so applyOperation
        // on it can only be reached by trying to resume the disposed
        // calculation directly.
        let err = ctx.initiate_calculation(4, id, 1, Settings::default()).unwrap_err();
        assert!(matches!(err, Error::BadId(_)));
    }

    /// Scenario 1 (§8): scalar-times-vector-plus-scalar.
    #[test]
    fn scalar_arithmetic_end_to_end() {
        let Some(mut ctx) = try_ctx() else { return };
        ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        let a = ctx.create_input_variable(InputValue::Scalar(3.0)).unwrap();
        let b = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let t = ctx.apply_operation(Opcode::Mul as u32, &[a, b]).unwrap();
        let y = ctx.apply_operation(Opcode::Add as u32, &[t, a]).unwrap();
        ctx.declare_output_variable(y).unwrap();

        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();
        assert_eq!(out[0], vec![6.0, 9.0, 12.0, 15.0]);
    }

    /// Scenario 2 (§8): sample mean/variance of a drawn variate.
    #[test]
    fn variate_mean_end_to_end() {
        let Some(mut ctx) = try_ctx() else { return };
        let n = 1000usize;
        let settings = Settings {
            rng_seed: 42,
            ..Settings::default()
        };
        ctx.initiate_calculation(n, 0, 1, settings).unwrap();
        let ids = ctx.create_input_variates(1, 1).unwrap();
        let variate = ids[0][0];
        ctx.declare_output_variable(variate).unwrap();

        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();

        let samples = &out[0];
        assert_eq!(samples.len(), n);
        let mean: f64 = samples.iter().sum::<f64>() / n as f64;
        let variance: f64 =
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((-0.1..=0.1).contains(&mean), "mean {mean} out of range");
        assert!((0.9..=1.1).contains(&variance), "variance {variance} out of range");
    }

    /// Scenario 3 (§8): the second run of the same `(id, version)` reuses
    /// the cached kernel, observable via a zero `nanosProgramBuild` delta.
    #[test]
    fn kernel_reuse_reports_zero_build_time_on_second_run() {
        let Some(mut ctx) = try_ctx() else { return };
        let settings = Settings {
            debug: true,
            ..Settings::default()
        };
        let (id, fresh1) = ctx.initiate_calculation(4, 0, 1, settings).unwrap();
        assert!(fresh1);
        let a = ctx.create_input_variable(InputValue::Scalar(3.0)).unwrap();
        let b = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let t = ctx.apply_operation(Opcode::Mul as u32, &[a, b]).unwrap();
        let y = ctx.apply_operation(Opcode::Add as u32, &[t, a]).unwrap();
        ctx.declare_output_variable(y).unwrap();
        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();

        let (_, fresh2) = ctx.initiate_calculation(4, id, 1, settings).unwrap();
        assert!(!fresh2);
        let a = ctx.create_input_variable(InputValue::Scalar(3.0)).unwrap();
        let b = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let t = ctx.apply_operation(Opcode::Mul as u32, &[a, b]).unwrap();
        let y = ctx.apply_operation(Opcode::Add as u32, &[t, a]).unwrap();
        ctx.declare_output_variable(y).unwrap();
        let before = ctx.debug_info().nanos_program_build;
        let mut out2 = vec![Vec::new()];
        ctx.finalize_calculation(&mut out2).unwrap();
        let after = ctx.debug_info().nanos_program_build;

        assert_eq!(out2[0], vec![6.0, 9.0, 12.0, 15.0]);
        assert_eq!(after, before, "cached-kernel run must not add build time");
    }

    /// Scenario 4 (§8): bumping `version` forces a rebuild with new semantics.
    #[test]
    fn version_bump_rebuilds_with_new_opcode_stream() {
        let Some(mut ctx) = try_ctx() else { return };
        let (id, _) = ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        let a = ctx.create_input_variable(InputValue::Scalar(3.0)).unwrap();
        let b = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let t = ctx.apply_operation(Opcode::Mul as u32, &[a, b]).unwrap();
        let y = ctx.apply_operation(Opcode::Add as u32, &[t, a]).unwrap();
        ctx.declare_output_variable(y).unwrap();
        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();
        assert_eq!(out[0], vec![6.0, 9.0, 12.0, 15.0]);

        let (_, fresh) = ctx.initiate_calculation(4, id, 2, Settings::default()).unwrap();
        assert!(fresh);
        let a = ctx.create_input_variable(InputValue::Scalar(3.0)).unwrap();
        let b = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let t = ctx.apply_operation(Opcode::Add as u32, &[a, b]).unwrap();
        ctx.declare_output_variable(t).unwrap();
        let mut out2 = vec![Vec::new()];
        ctx.finalize_calculation(&mut out2).unwrap();
        assert_eq!(out2[0], vec![4.0, 5.0, 6.0, 7.0]);
    }

    /// Scenario 5 (§8): `IndicatorEq` against a scalar, mixing exact,
    /// epsilon-close, and clearly-different vector elements. The tolerance
    /// is `42 * epsilon` of the *active* precision: under single precision
    /// `42 * FLT_EPSILON ~= 5.0e-6`, which would also swallow the
    /// `1.000001` element, so this scenario only distinguishes all three
    /// at `42 * DBL_EPSILON ~= 9.3e-15` and must run in double precision.
    #[test]
    fn indicator_eq_semantics_end_to_end() {
        let Some(mut ctx) = try_ctx() else { return };
        if !ctx.device_info().supports_double_precision {
            return;
        }
        let settings = Settings {
            use_double_precision: true,
            ..Settings::default()
        };
        ctx.initiate_calculation(3, 0, 1, settings).unwrap();
        let x = ctx
            .create_input_variable(InputValue::Vector(vec![1.0, 1.0 + 1e-20, 1.000_001]))
            .unwrap();
        let y = ctx.create_input_variable(InputValue::Scalar(1.0)).unwrap();
        let eq = ctx.apply_operation(Opcode::IndicatorEq as u32, &[x, y]).unwrap();
        ctx.declare_output_variable(eq).unwrap();

        let mut out = vec![Vec::new()];
        ctx.finalize_calculation(&mut out).unwrap();
        assert_eq!(out[0], vec![1.0, 1.0, 0.0]);
    }

    /// Boundary (§8): `createInputVariates(0, 0)` never touches the pool,
    /// so a subsequent real draw still starts from a poolSize of zero.
    #[test]
    fn create_input_variates_zero_dim_never_touches_pool() {
        let Some(mut ctx) = try_ctx() else { return };
        ctx.initiate_calculation(4, 0, 1, Settings::default()).unwrap();
        let ids = ctx.create_input_variates(0, 0).unwrap();
        assert!(ids.is_empty());
        assert!(ctx.initialized.as_ref().unwrap().pool.is_none());
    }

    /// Law (§8): replaying the same opcode stream on the same random inputs
    /// yields identical outputs, across a handful of randomly sized batches
    /// and randomly generated input vectors.
    #[test]
    fn replaying_same_opcode_stream_is_deterministic() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let Some(mut ctx) = try_ctx() else { return };
        let mut rng = StdRng::seed_from_u64(1234);

        for trial in 0..5u32 {
            let n = rng.gen_range(1..=32);
            let a_val: f64 = rng.gen_range(-10.0..10.0);
            let b_vals: Vec<f64> = (0..n).map(|_| rng.gen_range(-10.0..10.0)).collect();

            let run = |ctx: &mut ComputeContext, id: u32| -> Vec<f64> {
                ctx.initiate_calculation(n, id, 1, Settings::default()).unwrap();
                let a = ctx.create_input_variable(InputValue::Scalar(a_val)).unwrap();
                let b = ctx
                    .create_input_variable(InputValue::Vector(b_vals.clone()))
                    .unwrap();
                let t = ctx.apply_operation(Opcode::Mul as u32, &[a, b]).unwrap();
                let y = ctx.apply_operation(Opcode::Sub as u32, &[t, a]).unwrap();
                ctx.declare_output_variable(y).unwrap();
                let mut out = vec![Vec::new()];
                ctx.finalize_calculation(&mut out).unwrap();
                out.remove(0)
            };

            let first = run(&mut ctx, 0);
            let second = run(&mut ctx, 0);
            assert_eq!(first, second, "trial {trial}: replay must be bit-identical");
        }
    }
}
