//! GPU batch-normalization kernels using WGPU.
//!
//! The module has two halves:
//!
//! - A small device shim: [`DeviceManager`] brings up one adapter, device
//!   and queue, builds every [`Kernel`] up front and hands out [`Launch`]es
//!   that bind [`DeviceBuffer`] arguments by index and run a grid to
//!   completion. Bring-up is all or nothing: a kernel that fails validation
//!   or compilation is logged and the manager reports an error instead of
//!   limping along with a partial kernel set.
//! - `wgpu_bn_*` entry points used by [`dispatch`](super::dispatch). They
//!   convert to `f32`, run the kernels and convert back; any failure is
//!   logged and returns `None` so the caller can fall back to the CPU.
//!
//! The global manager is created lazily (via `lazy_static`) on first use.

use std::sync::mpsc;

use briny::prelude::*;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::BnGeometry;
use crate::matrix::Matrix;
use crate::real::Real;

/// Threads per workgroup in every kernel.
const WORKGROUP: u32 = 64;
/// Per-dimension dispatch limit guaranteed by WebGPU.
const MAX_GROUPS: u32 = 65_535;

/// A failure of the accelerator.
#[derive(Debug, Error)]
pub enum GpuFailure {
    /// No suitable adapter.
    #[error("adapter request failed: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// The adapter refused to create a device.
    #[error("device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// Kernel source was rejected before compilation.
    #[error("kernel '{0}' failed source validation")]
    Validation(&'static str),
    /// Shader compilation or pipeline creation failed.
    #[error("kernel '{kernel}' failed to build: {message}")]
    Build {
        /// Kernel name.
        kernel: &'static str,
        /// Driver message.
        message: String,
    },
    /// An argument index beyond the kernel's bindings.
    #[error("kernel '{kernel}' has {arity} arguments, index {index} is out of range")]
    BadArgument {
        /// Kernel name.
        kernel: &'static str,
        /// Offending index.
        index: usize,
        /// Number of bindings.
        arity: usize,
    },
    /// A launch with an argument left unset.
    #[error("kernel '{kernel}' launched with argument {index} unset")]
    Unbound {
        /// Kernel name.
        kernel: &'static str,
        /// First unset index.
        index: usize,
    },
    /// Waiting on or reading back from the device failed.
    #[error("device synchronization failed: {0}")]
    Sync(String),
    /// The global manager could not be brought up.
    #[error("accelerator unavailable: {0}")]
    Unavailable(String),
}

impl From<GpuFailure> for crate::Error {
    fn from(err: GpuFailure) -> Self {
        Self::Device(err.to_string())
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue with
    /// default limits.
    ///
    /// # Errors
    /// [`GpuFailure::Adapter`] or [`GpuFailure::Device`].
    pub fn new() -> Result<Self, GpuFailure> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        tracing::info!(adapter = %adapter.get_info().name, "GPU context ready");
        Ok(Self { device, queue })
    }
}

/// Secure wrapper for embedded WGSL source.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// How a kernel argument is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Small constant block.
    Uniform,
    /// Read-only storage.
    Read,
    /// Writable storage.
    ReadWrite,
}

/// The batch-normalization kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Batch mean and variance per `(map, unit)`.
    BnApplyMeanVar,
    /// Normalize, scale and shift.
    BnApply,
    /// Backward pass to the input.
    BnDelta,
    /// Per-unit partial gradient sums.
    BnGradHelper,
    /// Per-map reduction of the partial sums.
    BnGrad,
}

impl Kernel {
    /// Every kernel, in build order.
    pub const ALL: [Self; 5] = [Self::BnApplyMeanVar, Self::BnApply, Self::BnDelta, Self::BnGradHelper, Self::BnGrad];

    /// Name used for labels and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::BnApplyMeanVar => "bn_apply_mean_var",
            Self::BnApply => "bn_apply",
            Self::BnDelta => "bn_delta",
            Self::BnGradHelper => "bn_grad_helper",
            Self::BnGrad => "bn_grad",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::BnApplyMeanVar => include_str!("shaders/bn_apply_mean_var.wgsl"),
            Self::BnApply => include_str!("shaders/bn_apply.wgsl"),
            Self::BnDelta => include_str!("shaders/bn_delta.wgsl"),
            Self::BnGradHelper => include_str!("shaders/bn_grad_helper.wgsl"),
            Self::BnGrad => include_str!("shaders/bn_grad.wgsl"),
        }
    }

    /// Argument slots, by binding index. Slot 0 is always the parameters.
    pub fn bindings(self) -> &'static [Binding] {
        use Binding::{Read, ReadWrite, Uniform};
        match self {
            Self::BnApplyMeanVar => &[Uniform, Read, ReadWrite, ReadWrite],
            Self::BnApply => &[Uniform, Read, Read, Read, Read, Read, ReadWrite],
            Self::BnDelta => &[Uniform, Read, Read, Read, Read, Read, Read, ReadWrite],
            Self::BnGradHelper => &[Uniform, Read, Read, Read, Read, ReadWrite, ReadWrite],
            Self::BnGrad => &[Uniform, Read, Read, ReadWrite, ReadWrite],
        }
    }
}

fn layout_entry(binding: u32, kind: Binding) -> wgpu::BindGroupLayoutEntry {
    let ty = match kind {
        Binding::Uniform => wgpu::BufferBindingType::Uniform,
        Binding::Read => wgpu::BufferBindingType::Storage { read_only: true },
        Binding::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer { ty, has_dynamic_offset: false, min_binding_size: None },
        count: None,
    }
}

struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

fn build_kernel(device: &wgpu::Device, kernel: Kernel) -> Result<CompiledKernel, GpuFailure> {
    let name = kernel.name();
    WgslSource(kernel.source()).validate().map_err(|_| GpuFailure::Validation(name))?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(kernel.source().into()),
    });
    let entries: Vec<_> =
        kernel.bindings().iter().enumerate().map(|(i, &b)| layout_entry(i as u32, b)).collect();
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(name),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(name),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(GpuFailure::Build { kernel: name, message: err.to_string() });
    }
    Ok(CompiledKernel { pipeline, layout })
}

/// Owns the device and every compiled kernel.
pub struct DeviceManager {
    ctx: GpuContext,
    kernels: Vec<CompiledKernel>,
}

impl DeviceManager {
    /// Brings up the device and builds all kernels.
    ///
    /// # Errors
    /// The first bring-up or build failure; nothing is retried.
    pub fn new() -> Result<Self, GpuFailure> {
        let ctx = GpuContext::new()?;
        let mut kernels = Vec::with_capacity(Kernel::ALL.len());
        for kernel in Kernel::ALL {
            match build_kernel(&ctx.device, kernel) {
                Ok(k) => kernels.push(k),
                Err(err) => {
                    tracing::error!(kernel = kernel.name(), error = %err, "kernel build failed");
                    return Err(err);
                }
            }
        }
        tracing::info!(kernels = kernels.len(), "device kernels ready");
        Ok(Self { ctx, kernels })
    }

    /// The underlying device.
    pub fn device(&self) -> &wgpu::Device {
        &self.ctx.device
    }

    /// The submission queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.ctx.queue
    }

    /// Starts a launch of `kernel` with every argument unset.
    pub fn launch(&self, kernel: Kernel) -> Launch<'_> {
        Launch { manager: self, kernel, args: vec![None; kernel.bindings().len()] }
    }
}

lazy_static::lazy_static! {
    static ref DEVICE_MANAGER: Result<DeviceManager, String> =
        DeviceManager::new().map_err(|err| err.to_string());
}

/// The process-wide manager, brought up on first call.
///
/// # Errors
/// [`GpuFailure::Unavailable`] if bring-up failed; the failure is sticky.
pub fn device_manager() -> Result<&'static DeviceManager, GpuFailure> {
    DEVICE_MANAGER.as_ref().map_err(|msg| GpuFailure::Unavailable(msg.clone()))
}

/// A buffer living on the device.
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl DeviceBuffer {
    /// Uploads `data` as storage.
    pub fn from_slice(manager: &DeviceManager, label: &str, data: &[f32]) -> Self {
        // zero-sized bindings are invalid
        let padded: &[f32] = if data.is_empty() { &[0.0] } else { data };
        let buffer = manager.device().create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(padded),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });
        Self { buffer, len: data.len() }
    }

    /// Uploads a matrix, converting to `f32`.
    pub fn from_matrix<T: Real>(manager: &DeviceManager, label: &str, m: &Matrix<T>) -> Self {
        let data: Vec<f32> = m.as_slice().iter().map(|&x| x.into_f32()).collect();
        Self::from_slice(manager, label, &data)
    }

    /// Zero-filled storage of `len` elements.
    pub fn zeroed(manager: &DeviceManager, label: &str, len: usize) -> Self {
        let buffer = manager.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer, len }
    }

    /// A uniform block holding `value`.
    pub fn uniform<P: Pod>(manager: &DeviceManager, label: &str, value: &P) -> Self {
        let buffer = manager.device().create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        Self { buffer, len: 0 }
    }

    /// Copies the contents back to the host and waits for the copy.
    ///
    /// # Errors
    /// [`GpuFailure::Sync`] if polling or mapping fails.
    pub fn read(&self, manager: &DeviceManager) -> Result<Vec<f32>, GpuFailure> {
        let size = (self.len.max(1) * size_of::<f32>()) as u64;
        let staging = manager.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = manager
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        manager.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        manager.device().poll(wgpu::PollType::Wait).map_err(|e| GpuFailure::Sync(e.to_string()))?;
        rx.recv()
            .map_err(|e| GpuFailure::Sync(e.to_string()))?
            .map_err(|e| GpuFailure::Sync(e.to_string()))?;

        let view = slice.get_mapped_range();
        let mut out = bytemuck::pod_collect_to_vec::<u8, f32>(&view);
        drop(view);
        staging.unmap();
        out.truncate(self.len);
        Ok(out)
    }

    /// Reads the buffer back as a `rows × cols` matrix.
    ///
    /// # Errors
    /// See [`DeviceBuffer::read`].
    pub fn to_matrix<T: Real>(
        &self,
        manager: &DeviceManager,
        rows: usize,
        cols: usize,
    ) -> Result<Matrix<T>, GpuFailure> {
        let data = self.read(manager)?;
        Ok(Matrix::from_vec(rows, cols, data.into_iter().map(T::from_f32).collect()))
    }
}

/// A kernel with its arguments being bound.
pub struct Launch<'a> {
    manager: &'a DeviceManager,
    kernel: Kernel,
    args: Vec<Option<&'a DeviceBuffer>>,
}

impl<'a> Launch<'a> {
    /// Binds `buffer` to argument `index`.
    ///
    /// # Errors
    /// [`GpuFailure::BadArgument`] if `index` is not a binding of the kernel.
    pub fn set_argument(&mut self, index: usize, buffer: &'a DeviceBuffer) -> Result<(), GpuFailure> {
        let arity = self.args.len();
        let slot = self.args.get_mut(index).ok_or(GpuFailure::BadArgument {
            kernel: self.kernel.name(),
            index,
            arity,
        })?;
        *slot = Some(buffer);
        Ok(())
    }

    /// Runs `items` invocations of the kernel and blocks until they finish.
    ///
    /// Invocations are spread over a 2D grid of workgroups; kernels recover
    /// the flat index from `num_workgroups`.
    ///
    /// # Errors
    /// [`GpuFailure::Unbound`] if an argument was never set, or
    /// [`GpuFailure::Sync`] if waiting on the device fails.
    pub fn run(self, items: usize) -> Result<(), GpuFailure> {
        let name = self.kernel.name();
        let entries = self
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.map(|b| wgpu::BindGroupEntry { binding: i as u32, resource: b.buffer.as_entire_binding() })
                    .ok_or(GpuFailure::Unbound { kernel: name, index: i })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let compiled = &self.manager.kernels[self.kernel as usize];
        let device = self.manager.device();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name),
            layout: &compiled.layout,
            entries: &entries,
        });

        let [x, y] = grid(items);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
        {
            let mut pass =
                encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(name), timestamp_writes: None });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.manager.queue().submit(Some(encoder.finish()));
        device.poll(wgpu::PollType::Wait).map_err(|e| GpuFailure::Sync(e.to_string()))?;

        tracing::trace!(kernel = name, items, groups_x = x, groups_y = y, "kernel finished");
        Ok(())
    }
}

/// Workgroup grid covering `items` invocations.
fn grid(items: usize) -> [u32; 2] {
    let groups = (items as u32).div_ceil(WORKGROUP);
    let x = groups.clamp(1, MAX_GROUPS);
    [x, groups.div_ceil(x).max(1)]
}

/// Uniform block shared by every kernel; mirrors `Params` in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BnParams {
    num_map: u32,
    num_unit: u32,
    unit_offset: u32,
    local_units: u32,
    batch: u32,
    eps: f32,
    _pad: [u32; 2],
}

impl From<&BnGeometry> for BnParams {
    fn from(g: &BnGeometry) -> Self {
        Self {
            num_map: g.num_map as u32,
            num_unit: g.num_unit as u32,
            unit_offset: g.offset as u32,
            local_units: g.size as u32,
            batch: g.batch as u32,
            eps: g.eps as f32,
            _pad: [0; 2],
        }
    }
}

fn fall_back<R>(kernel: Kernel, result: Result<R, GpuFailure>) -> Option<R> {
    result
        .inspect_err(|err| tracing::warn!(kernel = kernel.name(), error = %err, "GPU kernel failed, using CPU"))
        .ok()
}

fn run_mean_var<T: Real>(u: &Matrix<T>, g: &BnGeometry) -> Result<(Matrix<T>, Matrix<T>), GpuFailure> {
    let mgr = device_manager()?;
    let rows = g.num_map * g.size;
    let params = DeviceBuffer::uniform(mgr, "bn_params", &BnParams::from(g));
    let u_buf = DeviceBuffer::from_matrix(mgr, "u", u);
    let mean = DeviceBuffer::zeroed(mgr, "mean", rows);
    let var = DeviceBuffer::zeroed(mgr, "var", rows);

    let mut launch = mgr.launch(Kernel::BnApplyMeanVar);
    launch.set_argument(0, &params)?;
    launch.set_argument(1, &u_buf)?;
    launch.set_argument(2, &mean)?;
    launch.set_argument(3, &var)?;
    launch.run(rows)?;

    Ok((mean.to_matrix(mgr, g.num_map, g.size)?, var.to_matrix(mgr, g.num_map, g.size)?))
}

fn run_apply<T: Real>(
    u: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    b: &Matrix<T>,
    g: &BnGeometry,
) -> Result<Matrix<T>, GpuFailure> {
    let mgr = device_manager()?;
    let rows = g.num_map * g.size;
    let params = DeviceBuffer::uniform(mgr, "bn_params", &BnParams::from(g));
    let inputs = [
        DeviceBuffer::from_matrix(mgr, "u", u),
        DeviceBuffer::from_matrix(mgr, "mean", mean),
        DeviceBuffer::from_matrix(mgr, "var", var),
        DeviceBuffer::from_matrix(mgr, "w", w),
        DeviceBuffer::from_matrix(mgr, "b", b),
    ];
    let out = DeviceBuffer::zeroed(mgr, "out", rows * g.batch);

    let mut launch = mgr.launch(Kernel::BnApply);
    launch.set_argument(0, &params)?;
    for (i, buf) in inputs.iter().enumerate() {
        launch.set_argument(i + 1, buf)?;
    }
    launch.set_argument(6, &out)?;
    launch.run(rows * g.batch)?;

    out.to_matrix(mgr, rows, g.batch)
}

#[allow(clippy::too_many_arguments)]
fn run_delta<T: Real>(
    u_appl: &Matrix<T>,
    u_diff: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    g: &BnGeometry,
) -> Result<Matrix<T>, GpuFailure> {
    let mgr = device_manager()?;
    let rows = g.num_map * g.size;
    let params = DeviceBuffer::uniform(mgr, "bn_params", &BnParams::from(g));
    let inputs = [
        DeviceBuffer::from_matrix(mgr, "u_appl", u_appl),
        DeviceBuffer::from_matrix(mgr, "u_diff", u_diff),
        DeviceBuffer::from_matrix(mgr, "delta", delta),
        DeviceBuffer::from_matrix(mgr, "mean", mean),
        DeviceBuffer::from_matrix(mgr, "var", var),
        DeviceBuffer::from_matrix(mgr, "w", w),
    ];
    let out = DeviceBuffer::zeroed(mgr, "nx", rows * g.batch);

    let mut launch = mgr.launch(Kernel::BnDelta);
    launch.set_argument(0, &params)?;
    for (i, buf) in inputs.iter().enumerate() {
        launch.set_argument(i + 1, buf)?;
    }
    launch.set_argument(7, &out)?;
    launch.run(rows)?;

    out.to_matrix(mgr, rows, g.batch)
}

fn run_grad<T: Real>(
    u_appl: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    g: &BnGeometry,
) -> Result<(Vec<T>, Vec<T>), GpuFailure> {
    let mgr = device_manager()?;
    let rows = g.num_map * g.size;
    let params = DeviceBuffer::uniform(mgr, "bn_params", &BnParams::from(g));
    let inputs = [
        DeviceBuffer::from_matrix(mgr, "u_appl", u_appl),
        DeviceBuffer::from_matrix(mgr, "delta", delta),
        DeviceBuffer::from_matrix(mgr, "mean", mean),
        DeviceBuffer::from_matrix(mgr, "var", var),
    ];
    let partial_w = DeviceBuffer::zeroed(mgr, "partial_w", rows);
    let partial_b = DeviceBuffer::zeroed(mgr, "partial_b", rows);

    let mut helper = mgr.launch(Kernel::BnGradHelper);
    helper.set_argument(0, &params)?;
    for (i, buf) in inputs.iter().enumerate() {
        helper.set_argument(i + 1, buf)?;
    }
    helper.set_argument(5, &partial_w)?;
    helper.set_argument(6, &partial_b)?;
    helper.run(rows)?;

    let dw = DeviceBuffer::zeroed(mgr, "dw", g.num_map);
    let db = DeviceBuffer::zeroed(mgr, "db", g.num_map);
    let mut reduce = mgr.launch(Kernel::BnGrad);
    reduce.set_argument(0, &params)?;
    reduce.set_argument(1, &partial_w)?;
    reduce.set_argument(2, &partial_b)?;
    reduce.set_argument(3, &dw)?;
    reduce.set_argument(4, &db)?;
    reduce.run(g.num_map)?;

    let widen = |v: Vec<f32>| v.into_iter().map(T::from_f32).collect();
    Ok((widen(dw.read(mgr)?), widen(db.read(mgr)?)))
}

/// GPU [`bn_mean_var`](super::cpu::bn_mean_var).
pub fn wgpu_bn_mean_var<T: Real>(u: &Matrix<T>, g: &BnGeometry) -> Option<(Matrix<T>, Matrix<T>)> {
    fall_back(Kernel::BnApplyMeanVar, run_mean_var(u, g))
}

/// GPU [`bn_apply`](super::cpu::bn_apply).
pub fn wgpu_bn_apply<T: Real>(
    u: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    b: &Matrix<T>,
    g: &BnGeometry,
) -> Option<Matrix<T>> {
    fall_back(Kernel::BnApply, run_apply(u, mean, var, w, b, g))
}

/// GPU [`bn_delta`](super::cpu::bn_delta).
#[allow(clippy::too_many_arguments)]
pub fn wgpu_bn_delta<T: Real>(
    u_appl: &Matrix<T>,
    u_diff: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    g: &BnGeometry,
) -> Option<Matrix<T>> {
    fall_back(Kernel::BnDelta, run_delta(u_appl, u_diff, delta, mean, var, w, g))
}

/// GPU [`bn_grad`](super::cpu::bn_grad).
pub fn wgpu_bn_grad<T: Real>(
    u_appl: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    g: &BnGeometry,
) -> Option<(Vec<T>, Vec<T>)> {
    fall_back(Kernel::BnGrad, run_grad(u_appl, delta, mean, var, g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cpu;

    #[test]
    fn embedded_kernels_pass_validation() {
        for kernel in Kernel::ALL {
            assert!(WgslSource(kernel.source()).validate().is_ok(), "{} rejected", kernel.name());
        }
    }

    #[test]
    fn params_block_is_uniform_sized() {
        assert_eq!(size_of::<BnParams>(), 32);
    }

    #[test]
    fn grid_covers_items() {
        assert_eq!(grid(0), [1, 1]);
        assert_eq!(grid(64), [1, 1]);
        assert_eq!(grid(65), [2, 1]);
        let [x, y] = grid(70_000_000);
        assert!(x as usize * y as usize * WORKGROUP as usize >= 70_000_000);
        assert!(x <= MAX_GROUPS);
    }

    fn sample(rows: usize, cols: usize, seed: u64) -> Matrix<f64> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        Matrix::from_fn(rows, cols, |_, _| rng.random_range(-1.0..1.0))
    }

    fn assert_near(gpu: &[f64], cpu: &[f64], what: &str) {
        assert_eq!(gpu.len(), cpu.len(), "{what} length");
        for (i, (a, b)) in gpu.iter().zip(cpu).enumerate() {
            assert!((a - b).abs() <= 1e-3 * (1.0 + b.abs()), "{what}[{i}]: gpu {a}, cpu {b}");
        }
    }

    #[test]
    fn kernels_match_cpu() {
        if device_manager().is_err() {
            return;
        }
        // (num_map, num_unit, offset, size, batch)
        for (num_map, num_unit, offset, size, batch) in [(2, 5, 1, 3, 7), (3, 4, 0, 4, 1), (1, 70, 5, 65, 3)] {
            let g = BnGeometry { num_map, num_unit, offset, size, batch, eps: 1e-8 };
            let rows = num_map * num_unit;
            let u = sample(rows, batch, 1);
            let u_diff = sample(rows, batch, 2).apply(|x| x.abs() + 0.1);
            let delta = sample(rows, batch, 3);
            let w = sample(1, num_map, 4);
            let b = sample(1, num_map, 5);

            let (mean, var) = cpu::bn_mean_var(&u, &g);
            let (gpu_mean, gpu_var) = run_mean_var(&u, &g).unwrap();
            assert_near(gpu_mean.as_slice(), mean.as_slice(), "mean");
            assert_near(gpu_var.as_slice(), var.as_slice(), "var");

            let out = run_apply(&u, &mean, &var, &w, &b, &g).unwrap();
            assert_near(out.as_slice(), cpu::bn_apply(&u, &mean, &var, &w, &b, &g).as_slice(), "apply");

            let nx = run_delta(&u, &u_diff, &delta, &mean, &var, &w, &g).unwrap();
            let expected = cpu::bn_delta(&u, &u_diff, &delta, &mean, &var, &w, &g);
            assert_near(nx.as_slice(), expected.as_slice(), "delta");

            let (dw, db) = run_grad(&u, &delta, &mean, &var, &g).unwrap();
            let (cpu_dw, cpu_db) = cpu::bn_grad(&u, &delta, &mean, &var, &g);
            assert_near(&dw, &cpu_dw, "dw");
            assert_near(&db, &cpu_db, "db");
        }
    }

    #[test]
    fn failures_surface_as_device_errors() {
        let err: crate::Error = GpuFailure::Unbound { kernel: "bn_apply", index: 3 }.into();
        assert!(matches!(err, crate::Error::Device(ref msg) if msg.contains("argument 3 unset")));
        match crate::ops::accelerator_ready() {
            Ok(()) => assert!(device_manager().is_ok()),
            Err(err) => assert!(matches!(err, crate::Error::Device(_))),
        }
    }

    #[test]
    fn kernel_order_matches_build_order() {
        for (i, kernel) in Kernel::ALL.iter().enumerate() {
            assert_eq!(*kernel as usize, i);
        }
    }
}
