// SPDX-License-Identifier: AGPL-3.0-only

//! wgpu compute context for the nonbonded engine.
//!
//! Creates a device on any available adapter and provides the buffer,
//! pipeline, and readback helpers the engine builds on. All engine math is
//! f32 with fixed-point force accumulation, so no optional shader features
//! are required and the context works on every backend wgpu supports.
//!
//! ## Adapter selection
//!
//! Explicit adapter targeting via `TIDEPOOL_GPU_ADAPTER`:
//!
//! | Value | Behavior |
//! |-------|----------|
//! | *(unset)* / `auto` | Prefer a discrete GPU, else first adapter |
//! | `0`, `1`, … | Select adapter by enumeration index |
//! | substring | Case-insensitive name match (e.g. `"4070"`) |
//!
//! Use [`GpuContext::enumerate_adapters`] to list available GPUs first.
//!
//! Synthesized WGSL goes through naga parse + validate *before* the device
//! sees it, so a malformed kernel surfaces as [`EngineError::KernelCompile`]
//! instead of a wgpu validation panic.

use crate::error::EngineError;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Summary of a discovered GPU adapter.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    /// Enumeration index (stable within a single run).
    pub index: usize,
    /// Adapter name as reported by the driver.
    pub name: String,
    /// Driver name (e.g. `"NVIDIA"`, `"radv"`, `"llvmpipe"`).
    pub driver: String,
    /// Adapter device type (discrete, integrated, software, etc.).
    pub device_type: wgpu::DeviceType,
}

impl std::fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.device_type {
            wgpu::DeviceType::DiscreteGpu => "discrete",
            wgpu::DeviceType::IntegratedGpu => "integrated",
            wgpu::DeviceType::VirtualGpu => "virtual",
            wgpu::DeviceType::Cpu => "cpu",
            wgpu::DeviceType::Other => "other",
        };
        write!(f, "[{}] {} ({}, {})", self.index, self.name, self.driver, kind)
    }
}

/// Compute context: device, queue, and adapter identity.
pub struct GpuContext {
    pub adapter_name: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    fn create_instance() -> wgpu::Instance {
        let backends = match std::env::var("TIDEPOOL_WGPU_BACKEND").as_deref() {
            Ok("vulkan") => wgpu::Backends::VULKAN,
            Ok("metal") => wgpu::Backends::METAL,
            Ok("dx12") => wgpu::Backends::DX12,
            Ok("gl") => wgpu::Backends::GL,
            _ => wgpu::Backends::all(),
        };
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        })
    }

    /// Enumerate all available GPU adapters.
    pub fn enumerate_adapters() -> Vec<AdapterSummary> {
        let instance = Self::create_instance();
        instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .enumerate()
            .map(|(i, adapter)| {
                let info = adapter.get_info();
                AdapterSummary {
                    index: i,
                    name: info.name.clone(),
                    driver: info.driver.clone(),
                    device_type: info.device_type,
                }
            })
            .collect()
    }

    /// Create a compute device on the selected adapter.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoAdapter`] if wgpu finds no adapter (or none matches
    /// `TIDEPOOL_GPU_ADAPTER`), [`EngineError::DeviceCreation`] if device
    /// creation fails.
    pub async fn new() -> Result<Self, EngineError> {
        let selector = std::env::var("TIDEPOOL_GPU_ADAPTER")
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        let instance = Self::create_instance();
        let adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(wgpu::Backends::all());
        if adapters.is_empty() {
            return Err(EngineError::NoAdapter);
        }

        let adapter = if selector.is_empty() || selector == "auto" {
            // Prefer a discrete GPU, fall back to whatever is first.
            let mut chosen: Option<wgpu::Adapter> = None;
            let mut fallback: Option<wgpu::Adapter> = None;
            for a in adapters {
                if a.get_info().device_type == wgpu::DeviceType::DiscreteGpu && chosen.is_none() {
                    chosen = Some(a);
                } else if fallback.is_none() {
                    fallback = Some(a);
                }
            }
            chosen.or(fallback).ok_or(EngineError::NoAdapter)?
        } else if let Ok(idx) = selector.parse::<usize>() {
            adapters
                .into_iter()
                .nth(idx)
                .ok_or(EngineError::NoAdapter)?
        } else {
            adapters
                .into_iter()
                .find(|a| a.get_info().name.to_ascii_lowercase().contains(&selector))
                .ok_or_else(|| {
                    EngineError::DeviceCreation(format!("No adapter matching '{selector}'"))
                })?
        };

        let adapter_info = adapter.get_info();
        log::info!(
            "tidepool GPU: {} ({:?})",
            adapter_info.name,
            adapter_info.device_type
        );

        // The synthesized kernel binds positions, accumulators, the neighbor
        // list, the exclusion CSR, and every registered parameter/argument as
        // separate storage buffers. Default limits cap at 8 per stage; raise
        // to what the adapter offers, up to 16.
        let adapter_limits = adapter.limits();
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: adapter_limits
                .max_storage_buffers_per_shader_stage
                .min(16),
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tidepool compute device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| EngineError::DeviceCreation(e.to_string()))?;

        Ok(Self {
            adapter_name: adapter_info.name,
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    /// Synchronous wrapper around [`GpuContext::new`].
    pub fn new_blocking() -> Result<Self, EngineError> {
        pollster::block_on(Self::new())
    }

    /// Access the underlying wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Access the underlying wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Validate WGSL host-side, then build a compute pipeline.
    ///
    /// # Errors
    ///
    /// [`EngineError::KernelCompile`] with the naga diagnostic if the source
    /// fails to parse or validate.
    pub fn create_pipeline(
        &self,
        shader_source: &str,
        label: &str,
    ) -> Result<wgpu::ComputePipeline, EngineError> {
        validate_wgsl(shader_source)?;

        let shader_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(shader_source.into()),
            });

        Ok(self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &shader_module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            }))
    }

    /// Create a storage buffer initialized from f32 data.
    pub fn create_f32_buffer(&self, data: &[f32], label: &str) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            })
    }

    /// Create a storage buffer initialized from u32 data.
    pub fn create_u32_buffer(&self, data: &[u32], label: &str) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            })
    }

    /// Create a zero-filled read-write storage buffer of `words` 4-byte words.
    pub fn create_output_buffer(&self, words: usize, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (words.max(1) * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Create a uniform buffer from raw bytes.
    pub fn create_uniform_buffer(&self, data: &[u8], label: &str) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
    }

    fn create_staging_buffer(&self, size: u64, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Overwrite a buffer's contents from offset 0 with f32 data.
    pub fn upload_f32(&self, buffer: &wgpu::Buffer, data: &[f32]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    /// Overwrite a buffer's contents from offset 0 with u32 data.
    pub fn upload_u32(&self, buffer: &wgpu::Buffer, data: &[u32]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    /// Zero the first `words` 4-byte words of a buffer.
    pub fn zero_buffer(&self, buffer: &wgpu::Buffer, words: usize) {
        let zeros = vec![0u8; words * 4];
        self.queue.write_buffer(buffer, 0, &zeros);
    }

    fn read_back_bytes(&self, buffer: &wgpu::Buffer, bytes: u64) -> Result<Vec<u8>, EngineError> {
        let staging = self.create_staging_buffer(bytes, "readback");
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| EngineError::Readback("map callback channel dropped".into()))?
            .map_err(|e| EngineError::Readback(format!("buffer mapping: {e}")))?;

        let data = slice.get_mapped_range();
        let result = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    /// Read back `count` f32 values from a storage buffer.
    pub fn read_back_f32(
        &self,
        buffer: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<f32>, EngineError> {
        let bytes = self.read_back_bytes(buffer, (count * 4) as u64)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Read back `count` u32 values from a storage buffer.
    pub fn read_back_u32(
        &self,
        buffer: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<u32>, EngineError> {
        let bytes = self.read_back_bytes(buffer, (count * 4) as u64)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Read back `count` i32 values from a storage buffer.
    pub fn read_back_i32(
        &self,
        buffer: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<i32>, EngineError> {
        let bytes = self.read_back_bytes(buffer, (count * 4) as u64)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Dispatch a compute pipeline in its own submission and wait-free return.
    pub fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: u32,
        label: &str,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Create a bind group from a pipeline and ordered buffer slice.
    ///
    /// Each buffer is bound at binding index 0, 1, 2, ... in order.
    pub fn create_bind_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
        label: &str,
    ) -> wgpu::BindGroup {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        })
    }
}

/// Parse and validate WGSL without touching the device.
///
/// # Errors
///
/// [`EngineError::KernelCompile`] carrying the naga diagnostic.
pub fn validate_wgsl(source: &str) -> Result<(), EngineError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| EngineError::KernelCompile(e.emit_to_string(source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| EngineError::KernelCompile(format!("{e:?}")))?;
    Ok(())
}
