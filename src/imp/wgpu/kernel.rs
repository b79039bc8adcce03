// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The two compute pipelines: conversion and mip downsampling.

use std::num::NonZeroU64;
use wgpu::{
    BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType,
    BufferBindingType, ComputePipeline, ShaderStages, StorageTextureAccess, TextureFormat,
    TextureSampleType, TextureViewDimension,
};

pub(super) const TEXTURE_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

#[derive(Debug)]
pub(super) struct Kernels {
    pub(super) convert: ComputePipeline,
    pub(super) convert_layout: BindGroupLayout,
    pub(super) downsample: ComputePipeline,
    pub(super) downsample_layout: BindGroupLayout,
}

fn storage_texture(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::StorageTexture {
            access: StorageTextureAccess::WriteOnly,
            format: TEXTURE_FORMAT,
            view_dimension: TextureViewDimension::D2,
        },
        count: None,
    }
}

fn pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &BindGroupLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

impl Kernels {
    pub(super) fn new(device: &wgpu::Device) -> Self {
        logwise::info_sync!("compiling conversion kernels");
        let convert_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("convert layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_texture(1),
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(32),
                    },
                    count: None,
                },
            ],
        });
        let downsample_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("downsample layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    //rgba32float is not filterable everywhere; we only textureLoad
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: false },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                storage_texture(1),
            ],
        });
        let convert_module = device.create_shader_module(wgpu::include_wgsl!("convert.wgsl"));
        let downsample_module =
            device.create_shader_module(wgpu::include_wgsl!("downsample.wgsl"));
        Kernels {
            convert: pipeline(device, "convert", &convert_layout, &convert_module, "convert"),
            convert_layout,
            downsample: pipeline(
                device,
                "downsample",
                &downsample_layout,
                &downsample_module,
                "downsample",
            ),
            downsample_layout,
        }
    }
}
