// =============================================================================
// VULKAN SCENE RENDERER
// =============================================================================
//
// A small scene renderer built around an explicit swap chain core. The parts
// live in three tiers by lifetime:
//
//   DeviceContext  - one GPU connection, lives for the whole run
//   Scene          - geometry and textures, survive window changes
//   Swapchain + Connection - sized to the window, rebuilt on resize
//
// FRAME CYCLE (per presented image):
// 1. Wait for this slot's previous frame to retire
// 2. Acquire a swap chain image
// 3. Wait out any other slot still using that image
// 4. Update the image's uniform buffers
// 5. Submit the image's pre-recorded command buffer
// 6. Present, rebuilding afterwards if the surface went stale
// 7. Advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod connection;
mod scene;

use anyhow::Result;
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

use backend::{AcquireOutcome, BackendError, DeviceContext, PresentOutcome, Swapchain};
use config::Config;
use connection::Connection;
use scene::Scene;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!("Starting vkscene");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// All long-lived state. Field order encodes teardown order: the connection
/// layer drops before the swap chain it was built against, and both drop
/// before the scene and the device.
struct App {
    config: Config,
    window: Option<Arc<Window>>,

    connection: Option<Connection>,
    swapchain: Option<Swapchain>,
    scene: Option<Scene>,
    device: Option<Arc<DeviceContext>>,

    /// Rebuild the swap chain before (or right after) the next present.
    needs_rebuild: bool,
    /// Zero-sized window; skip rendering and let the event loop block.
    is_minimized: bool,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
    render_error_count: u64,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            connection: None,
            swapchain: None,
            scene: None,
            device: None,
            needs_rebuild: false,
            is_minimized: false,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
            render_error_count: 0,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> backend::Result<()> {
        log::info!("Initializing Vulkan...");
        let device = DeviceContext::new(
            &window,
            self.config.debug.validation_layers,
            self.config.graphics.anisotropy,
        )?;
        self.device = Some(device.clone());
        self.scene = Some(Scene::load(device)?);
        self.window = Some(window);
        self.build_presentation()?;
        log::info!("Vulkan initialized");
        Ok(())
    }

    /// Builds the swap chain and the connection layer on top of it. Assumes
    /// neither currently exists and the window has nonzero size.
    fn build_presentation(&mut self) -> backend::Result<()> {
        let (Some(device), Some(scene), Some(window)) =
            (&self.device, &self.scene, &self.window)
        else {
            return Ok(());
        };
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            self.config.preferred_present_mode(),
            self.config.frames_in_flight(),
        )?;
        let connection = Connection::new(
            device.clone(),
            &swapchain,
            scene,
            self.config.graphics.clear_color,
            &PathBuf::from(&self.config.graphics.shader_dir),
        )?;
        self.swapchain = Some(swapchain);
        self.connection = Some(connection);
        Ok(())
    }

    /// Tears down and rebuilds everything sized to the window. A failure
    /// here is fatal: the old chain is already gone, so the caller cannot
    /// fall back to it.
    fn rebuild_presentation(&mut self) -> backend::Result<()> {
        self.try_rebuild()
            .map_err(|e| BackendError::Rebuild(Box::new(e)))
    }

    fn try_rebuild(&mut self) -> backend::Result<()> {
        if let Some(device) = &self.device {
            device.wait_idle()?;
        }
        // The surface allows only one swap chain; drop before recreating.
        self.connection = None;
        self.swapchain = None;

        let Some(window) = &self.window else {
            return Ok(());
        };
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;
        log::info!("Rebuilding swap chain at {}x{}", size.width, size.height);
        self.build_presentation()
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Runs one pass of the frame cycle. Returns whether an image was
    /// actually presented; a skipped frame (minimized, rebuilt mid-cycle)
    /// is not an error.
    fn render_frame(&mut self) -> backend::Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        if self.needs_rebuild {
            self.needs_rebuild = false;
            self.rebuild_presentation()?;
            if self.is_minimized {
                return Ok(false);
            }
        }

        // Steps 1-2: wait for this slot, then acquire.
        let acquired = {
            let Some(swapchain) = self.swapchain.as_ref() else {
                return Ok(false);
            };
            swapchain.wait_for_current_frame()?;
            swapchain.acquire()?
        };
        let (image_index, suboptimal) = match acquired {
            AcquireOutcome::Image { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                // Nothing was acquired; rebuild and try again next frame.
                self.rebuild_presentation()?;
                return Ok(false);
            }
        };
        if suboptimal {
            self.needs_rebuild = true;
        }

        let elapsed_secs = self.start_time.elapsed().as_secs_f32();
        {
            let (Some(swapchain), Some(connection), Some(scene)) = (
                self.swapchain.as_mut(),
                self.connection.as_mut(),
                self.scene.as_ref(),
            ) else {
                return Ok(false);
            };

            // Step 3: the image may still belong to another slot.
            swapchain.claim_image(image_index)?;
            // Step 4: refresh this image's uniforms.
            connection.update_uniforms(image_index, scene, elapsed_secs)?;
            // Step 5: replay the image's pre-recorded commands.
            swapchain.submit(image_index, connection.command_buffer(image_index))?;
            // Step 6: queue presentation.
            if swapchain.present(image_index)? == PresentOutcome::NeedsRebuild {
                self.needs_rebuild = true;
            }
            // Step 7: move to the next slot.
            swapchain.advance_frame();
        }

        // A stale present (or a resize observed mid-frame) rebuilds now,
        // while the frame already on screen covers the gap.
        if self.needs_rebuild {
            self.needs_rebuild = false;
            self.rebuild_presentation()?;
        }
        Ok(true)
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(window) = &self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window) {
            log::error!("Failed to initialize Vulkan: {e:#}");
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                if let Some(device) = &self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    // Rebuild lazily, right before the next frame.
                    self.is_minimized = false;
                    self.needs_rebuild = true;
                    if let Some(window) = &self.window {
                        window.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    log::error!("Unrecoverable render error: {e:#}");
                    event_loop.exit();
                }
                Err(e) => {
                    // Keep running through transient errors, but don't let
                    // a persistent one flood the log.
                    self.render_error_count += 1;
                    if self.render_error_count % 100 == 1 {
                        log::error!(
                            "Render error ({} so far): {e:#}",
                            self.render_error_count
                        );
                    } else {
                        log::debug!("Render error: {e:#}");
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("Escape pressed, exiting");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    /// While minimized, no redraw is requested, so the loop blocks here
    /// until the window gets a size again.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up");
        if let Some(device) = &self.device {
            let _ = device.wait_idle();
        }
        // Fields drop in declaration order: connection, swap chain, scene,
        // then the device context itself.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_app_starts_with_clean_counters() {
        let app = App::new(Config::default());
        assert_eq!(app.render_error_count, 0);
        assert_eq!(app.frame_count, 0);
        assert!(!app.needs_rebuild);
        assert!(!app.is_minimized);
        assert!(app.window.is_none());
        assert!(app.device.is_none());
    }
}
