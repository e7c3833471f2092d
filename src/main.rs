// =============================================================================
// FRAME CORE DEMO - rotating cube over a procedural skybox
// =============================================================================
//
// FRAME FLOW:
// 1. winit asks for a redraw
// 2. begin_frame (waits for the slot, acquires an image)
// 3. update camera, draw the cube
// 4. end_frame (submit + present)
//
// Everything the renderer needs from disk (SPIR-V, pipeline cache) is read
// here and handed over; the pipeline cache is written back on exit.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_core::backend::pipeline::{ShaderSources, Vertex};
use frame_core::config::AssetConfig;
use frame_core::renderer::record_frame;
use frame_core::{
    Config, FrameError, IndexBuffer, Renderer, RendererAssets, StagingBuffer, SurfaceTarget,
    VertexBuffer,
};
use glam::{Mat4, Vec3, Vec4};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

const SKYBOX_SIZE: u32 = 64;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame-core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging. RUST_LOG wins over the default "info" filter; with
/// `log_to_file` every record goes to the log file instead of stderr.
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    let mut file_error = None;
    if config.debug.log_to_file {
        match open_log_file(Path::new(&config.debug.log_file)) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
                builder.write_style(env_logger::WriteStyle::Never);
            }
            Err(err) => file_error = Some(err),
        }
    }

    builder.init();

    if let Some(err) = file_error {
        log::warn!("Logging to stderr, could not open {}: {:#}", config.debug.log_file, err);
    }
}

/// Truncate the log file and write the session header
fn open_log_file(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    writeln!(file, "=== Frame Core Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

/// Read SPIR-V and the optional pipeline cache from disk
fn load_assets(assets: &AssetConfig) -> Result<RendererAssets> {
    let read = |path: &Path| {
        std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))
    };

    let shaders = ShaderSources {
        geometry_vert: read(&assets.geometry_vert)?,
        geometry_frag: read(&assets.geometry_frag)?,
        skybox_vert: read(&assets.skybox_vert)?,
        skybox_frag: read(&assets.skybox_frag)?,
    };

    let pipeline_cache = match std::fs::read(&assets.pipeline_cache) {
        Ok(blob) => Some(blob),
        Err(err) => {
            log::info!("No pipeline cache at {:?} ({}), starting cold", assets.pipeline_cache, err);
            None
        }
    };

    Ok(RendererAssets {
        shaders,
        pipeline_cache,
    })
}

// =============================================================================
// SCENE
// =============================================================================

/// GPU-side geometry for the cube
struct Scene {
    vertices: VertexBuffer,
    indices: IndexBuffer,
    index_count: u32,
}

/// 24 vertices (4 per face, so normals stay flat) and 36 indices
fn cube_mesh() -> (Vec<Vertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
        // normal, u axis, v axis, color
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.9, 0.3, 0.3]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.3]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.3, 0.3, 0.9]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.9, 0.9, 0.3]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.9, 0.3, 0.9]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.9]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, u, v, color) in faces {
        let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = (n + u * su + v * sv) * 0.5;
            vertices.push(Vertex {
                position: position.to_array(),
                normal,
                color,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    (vertices, indices)
}

/// Six RGBA faces with a vertical gradient, tinted per face
fn skybox_pixels(size: u32) -> Vec<u8> {
    let tints: [[f32; 3]; 6] = [
        [1.0, 0.8, 0.7],
        [0.7, 0.8, 1.0],
        [0.6, 0.8, 1.0],
        [0.2, 0.2, 0.3],
        [0.9, 0.9, 1.0],
        [0.8, 0.9, 0.9],
    ];

    let mut pixels = Vec::with_capacity((size * size * 4 * 6) as usize);
    for tint in tints {
        for y in 0..size {
            let shade = 0.4 + 0.6 * (1.0 - y as f32 / size as f32);
            for _ in 0..size {
                for channel in tint {
                    pixels.push((channel * shade * 255.0) as u8);
                }
                pixels.push(255);
            }
        }
    }
    pixels
}

/// Upload the cube through staging buffers and install the skybox
fn build_scene(renderer: &mut Renderer) -> Result<Scene> {
    let device = Arc::clone(renderer.device());
    let (vertices, indices) = cube_mesh();
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);

    let vertex_buffer = VertexBuffer::new_device_local(&device, vertex_bytes.len() as u64)?;
    let index_buffer = IndexBuffer::new_device_local(&device, index_bytes.len() as u64)?;

    let staging = StagingBuffer::with_data(&device, vertex_bytes)?;
    staging.transfer_to_buffer_immediate(
        &device,
        &vertex_buffer,
        vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: vertex_bytes.len() as u64,
        },
    )?;

    let staging = StagingBuffer::with_data(&device, index_bytes)?;
    staging.transfer_to_buffer_immediate(
        &device,
        &index_buffer,
        vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: index_bytes.len() as u64,
        },
    )?;

    let mut skybox = renderer.create_cube_map(SKYBOX_SIZE, vk::Format::R8G8B8A8_SRGB)?;
    let staging = StagingBuffer::with_data(&device, &skybox_pixels(SKYBOX_SIZE))?;
    staging.transfer_to_image_immediate(&device, &mut skybox)?;
    renderer.update_skybox(skybox)?;

    log::info!("Scene uploaded: {} vertices, {} indices", vertices.len(), indices.len());

    Ok(Scene {
        vertices: vertex_buffer,
        indices: index_buffer,
        index_count: indices.len() as u32,
    })
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the scene's buffers go before the renderer.
struct App {
    config: Config,

    scene: Option<Scene>,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            scene: None,
            renderer: None,
            window: None,
            is_fullscreen,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let target = SurfaceTarget::from_window(window);
        let assets = load_assets(&self.config.assets)?;

        let mut capabilities = self.config.capabilities();
        let size = window.inner_size();
        capabilities.width = size.width;
        capabilities.height = size.height;

        let mut renderer = Renderer::init(capabilities, &target, assets)?;
        let scene = build_scene(&mut renderer)?;

        self.renderer = Some(renderer);
        self.scene = Some(scene);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// `Ok(false)` when the window is minimized and nothing was drawn
    fn render_frame(&mut self) -> Result<bool, FrameError> {
        let (Some(renderer), Some(scene), Some(window)) =
            (self.renderer.as_mut(), self.scene.as_ref(), self.window.as_ref())
        else {
            return Ok(false);
        };

        let size = window.inner_size();
        let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
        let t = self.start_time.elapsed().as_secs_f32();

        let mut projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.2, 3.0), Vec3::ZERO, Vec3::Y);
        let model = Mat4::from_rotation_y(t) * Mat4::from_rotation_x(t * 0.5);
        let clear_color = Vec4::from(self.config.renderer.clear_color);

        record_frame(renderer, |renderer| {
            renderer.clear(clear_color)?;
            renderer.update_camera(projection * view * model)?;
            renderer.draw(&scene.indices, &scene.vertices, scene.index_count)
        })
    }

    fn shutdown(&mut self) {
        let Some(renderer) = self.renderer.take() else {
            return;
        };

        if let Err(err) = renderer.device().wait_idle() {
            log::warn!("Device wait failed at exit: {:#}", err);
        }
        self.scene = None;

        match renderer.pipeline_cache_data() {
            Ok(blob) => match std::fs::write(&self.config.assets.pipeline_cache, &blob) {
                Ok(()) => log::info!("Wrote pipeline cache ({} bytes)", blob.len()),
                Err(err) => log::warn!("Failed to write pipeline cache: {}", err),
            },
            Err(err) => log::warn!("{:#}", err),
        }

        if let Err(err) = renderer.shutdown() {
            log::error!("Renderer shutdown failed: {:#}", err);
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
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

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
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

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                std::process::exit(1);
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:#}", e);
            std::process::exit(1);
        }

        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match code {
                KeyCode::Escape => {
                    self.shutdown();
                    event_loop.exit();
                }
                KeyCode::F11 => self.toggle_fullscreen(),
                _ => {}
            },

            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                match self.render_frame() {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(err) => log::warn!("Frame dropped: {}", err),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
