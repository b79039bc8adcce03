// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use wgpu::{DownlevelFlags, PollType, Trace};

/// Owns the GPU objects and the poll thread.
#[derive(Debug)]
struct BoundDeviceResources {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    poll_thread: Option<JoinHandle<()>>,
    poll_shutdown: Arc<AtomicBool>,
    poll_trigger: Option<Sender<()>>,
}

/// A device bound to an adapter, with a background thread that drives wgpu callbacks.
///
/// Clones share the same device.
#[derive(Debug, Clone)]
pub struct BoundDevice {
    resources: Arc<BoundDeviceResources>,
}

impl BoundDevice {
    /// Picks the default adapter (honoring `WGPU_BACKEND` and friends) and binds a device.
    pub async fn pick() -> Result<Self, Error> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let options = wgpu::RequestAdapterOptions {
            power_preference: Default::default(),
            force_fallback_adapter: false,
            compatible_surface: None,
        };
        let adapter = instance
            .request_adapter(&options)
            .await
            .map_err(|_| Error::NoSuchAdapter)?;
        Self::bind(adapter).await
    }

    /// Binds a device on `adapter`.  Fails when the adapter cannot run compute shaders.
    pub async fn bind(adapter: wgpu::Adapter) -> Result<Self, Error> {
        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(DownlevelFlags::COMPUTE_SHADERS) {
            return Err(Error::ComputeUnsupported);
        }
        let info = adapter.get_info();
        logwise::info_sync!(
            "binding device on {adapter}",
            adapter = logwise::privacy::LogIt(&info)
        );
        let descriptor = wgpu::DeviceDescriptor {
            label: Some("texture_streaming device"),
            required_features: Default::default(),
            //staging buffers and textures can be large; take what the adapter offers
            required_limits: adapter.limits(),
            memory_hints: Default::default(),
            trace: Trace::Off,
        };
        let (device, queue) = adapter.request_device(&descriptor).await?;

        let poll_shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = poll_shutdown.clone();
        let poll_device = device.clone();
        let (poll_sender, poll_receiver): (Sender<()>, Receiver<()>) = mpsc::channel();
        let poll_thread = thread::Builder::new()
            .name("wgpu_poll".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    match poll_receiver.recv() {
                        //wait until everything submitted so far is done, firing callbacks
                        Ok(_) => {
                            let _ = poll_device.poll(PollType::Wait);
                        }
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| Error::PollThread(e.to_string()))?;

        Ok(BoundDevice {
            resources: Arc::new(BoundDeviceResources {
                device,
                queue,
                adapter,
                poll_thread: Some(poll_thread),
                poll_shutdown,
                poll_trigger: Some(poll_sender),
            }),
        })
    }

    /// Wakes the poll thread so pending callbacks fire.
    pub fn set_needs_poll(&self) {
        if let Some(trigger) = &self.resources.poll_trigger {
            let _ = trigger.send(());
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.resources.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.resources.queue
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.resources.adapter
    }
}

impl Drop for BoundDeviceResources {
    fn drop(&mut self) {
        self.poll_shutdown.store(true, Ordering::Relaxed);
        //closing the channel unblocks recv
        drop(self.poll_trigger.take());
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}
