//! bvh-tool - build, refit and inspect acceleration structures on the
//! software device.

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::env;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use radv_bvh::accel::encode_flags;
use radv_bvh::bvh::format::InstanceInput;
use radv_bvh::util::MAT3X4_IDENTITY;
use radv_bvh::prelude::*;

/// Log filter, e.g. `RADV_BVH_LOG=radv_bvh=debug`.
const ENV_LOG: &str = "RADV_BVH_LOG";
/// Write a chrome trace when set (feature `chrome-trace`).
const ENV_TRACE: &str = "RADV_BVH_TRACE";

struct Options {
    gfx: Option<GfxLevel>,
    count: u32,
    seed: u64,
    aabbs: bool,
    instances: u32,
    update: bool,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            gfx: None,
            count: 1000,
            seed: 1,
            aabbs: false,
            instances: 0,
            update: false,
            json: false,
        }
    }
}

fn main() {
    let _guard = init_tracing();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() -> Option<Box<dyn std::any::Any>> {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    #[cfg(feature = "chrome-trace")]
    if env::var_os(ENV_TRACE).is_some() {
        let (chrome, guard) = tracing_chrome::ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(filter).with(fmt).with(chrome).init();
        return Some(Box::new(guard));
    }
    #[cfg(not(feature = "chrome-trace"))]
    if env::var_os(ENV_TRACE).is_some() {
        eprintln!("{ENV_TRACE} ignored: rebuild with --features chrome-trace");
    }

    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "build" | "b" => cmd_build(&parse_options(&args[1..])?),
        "config" | "c" => cmd_config(args.get(1).map(String::as_str)),
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => bail!("unknown command '{other}' (try 'bvh-tool help')"),
    }
}

fn print_help() {
    println!("bvh-tool - RADV acceleration structure model");
    println!();
    println!("Usage:");
    println!("  bvh-tool build [options]   Build a random scene and report on it");
    println!("  bvh-tool config [--save]   Print (or save) the device config");
    println!();
    println!("Build options:");
    println!("  --gfx <level>        gfx10_3, gfx11 or gfx12 (default: from config)");
    println!("  --count <n>          primitives (default 1000)");
    println!("  --seed <n>           random seed (default 1)");
    println!("  --aabbs              procedural AABBs instead of triangles");
    println!("  --instances <n>      also build a TLAS with n instances");
    println!("  --update             jitter the geometry and refit in place");
    println!("  --json               print statistics as JSON");
    println!();
    println!("Environment:");
    println!("  {ENV_LOG}        log filter (e.g. radv_bvh=debug)");
    println!("  {ENV_TRACE}      write a chrome trace (feature chrome-trace)");
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--gfx" => options.gfx = Some(value("--gfx")?.parse()?),
            "--count" | "-n" => options.count = value("--count")?.parse().context("--count")?,
            "--seed" => options.seed = value("--seed")?.parse().context("--seed")?,
            "--instances" => options.instances = value("--instances")?.parse().context("--instances")?,
            "--aabbs" => options.aabbs = true,
            "--update" | "-u" => options.update = true,
            "--json" | "-j" => options.json = true,
            other => bail!("unknown option '{other}'"),
        }
    }
    Ok(options)
}

fn cmd_config(arg: Option<&str>) -> Result<()> {
    let config = DeviceConfig::load();
    match arg {
        None => println!("{}", serde_json::to_string_pretty(&config)?),
        Some("--save") => {
            let path = DeviceConfig::path().context("no config directory on this system")?;
            config.save(&path)?;
            println!("Saved {}", path.display());
        }
        Some(other) => bail!("unknown option '{other}'"),
    }
    Ok(())
}

/// Primitive data plus the geometry that references it.
struct Scene {
    buffer: Arc<radv_bvh::device::Buffer>,
    geometry: Geometry,
    values: Vec<f32>,
}

fn random_scene(device: &Device, rng: &mut StdRng, count: u32, aabbs: bool) -> Result<Scene> {
    let floats_per_prim = if aabbs { 6 } else { 9 };
    let mut values = Vec::with_capacity(count as usize * floats_per_prim);
    for _ in 0..count {
        let center: [f32; 3] = [rng.random_range(-50.0..50.0), rng.random_range(-50.0..50.0), rng.random_range(-50.0..50.0)];
        if aabbs {
            let half: [f32; 3] = [rng.random_range(0.01..1.0), rng.random_range(0.01..1.0), rng.random_range(0.01..1.0)];
            values.extend((0..3).map(|a| center[a] - half[a]));
            values.extend((0..3).map(|a| center[a] + half[a]));
        } else {
            for _ in 0..3 {
                values.extend((0..3).map(|a| center[a] + rng.random_range(-1.0..1.0f32)));
            }
        }
    }

    let buffer = device.create_buffer((values.len() * 4).max(4) as u64)?;
    device.memory().upload(buffer.va(), bytemuck::cast_slice(&values))?;
    let kind = if aabbs {
        GeometryKind::Aabbs(AabbsData {
            data: buffer.va(),
            stride: 24,
        })
    } else {
        GeometryKind::Triangles(TrianglesData {
            vertex_format: VertexFormat::R32G32B32Sfloat,
            vertex_data: buffer.va(),
            vertex_stride: 12,
            max_vertex: (count * 3).saturating_sub(1),
            index_type: IndexType::None,
            index_data: 0,
            transform_data: 0,
        })
    };
    Ok(Scene {
        buffer,
        geometry: Geometry {
            kind,
            flags: GeometryFlags::OPAQUE,
        },
        values,
    })
}

/// Build one structure, returning it with the sizes it was built with.
fn build(
    device: &Arc<Device>,
    ty: AccelStructType,
    geometry: Geometry,
    count: u32,
    flags: BuildAccelFlags,
) -> Result<(AccelerationStructure, BuildSizes)> {
    let sizes = get_build_sizes(device, ty, &[geometry], &[count])?;
    let accel = create_acceleration_structure(device, ty, sizes.accel_struct_size)?;
    let scratch = device.create_buffer(sizes.build_scratch_size.max(sizes.update_scratch_size))?;

    let info = BuildGeometryInfo {
        ty,
        flags,
        mode: BuildMode::Build,
        src: 0,
        dst: accel.va(),
        geometries: vec![geometry],
        scratch: scratch.va(),
    };
    let ranges = [BuildRangeInfo {
        primitive_count: count,
        ..Default::default()
    }];
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges])?;
    let stats = cmd.submit()?;
    tracing::info!(?ty, dispatches = stats.dispatches, invocations = stats.invocations, "built");
    device.destroy_buffer(scratch.va())?;
    Ok((accel, sizes))
}

fn report(device: &Device, name: &str, accel: &AccelerationStructure, flags: BuildFlags, json: bool) -> Result<bool> {
    let inspector = Inspector::new(device.memory(), accel.va(), flags)?;
    let stats = inspector.stats();
    let issues = inspector.validate();

    if json {
        let value = serde_json::json!({
            "structure": name,
            "stats": stats,
            "issues": issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{name}: {} ({} bytes)", stats.variant, stats.compacted_size);
        println!("  internal nodes: {}", stats.internal_nodes);
        println!("  leaves:         {}", stats.leaf_nodes);
        println!("  max depth:      {}", stats.max_depth);
        println!("  SAH cost:       {:.3}", stats.sah_cost);
        println!("  children:       {:?}", stats.child_histogram);
        if issues.is_empty() {
            println!("  valid");
        } else {
            for issue in &issues {
                println!("  ! {issue}");
            }
        }
    }
    Ok(issues.is_empty())
}

fn cmd_build(options: &Options) -> Result<()> {
    let mut config = DeviceConfig::load();
    if let Some(gfx) = options.gfx {
        config.gfx_level = gfx;
    }
    let device = Device::new(config.clone())?;
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut scene = random_scene(&device, &mut rng, options.count, options.aabbs)?;
    let mut build_flags = BuildAccelFlags::PREFER_FAST_TRACE;
    if options.update {
        build_flags |= BuildAccelFlags::ALLOW_UPDATE;
    }
    let kernel_flags = encode_flags(&config, build_flags);
    let (blas, sizes) = build(&device, AccelStructType::BottomLevel, scene.geometry, options.count, build_flags)?;
    if !options.json {
        println!("{} on {}", if options.aabbs { "AABBs" } else { "Triangles" }, config.gfx_level.name());
        println!(
            "  sizes: structure {} / build scratch {} / update scratch {}",
            sizes.accel_struct_size, sizes.build_scratch_size, sizes.update_scratch_size
        );
    }
    let mut valid = report(&device, "blas", &blas, kernel_flags, options.json)?;

    if options.update {
        for v in scene.values.iter_mut() {
            *v += rng.random_range(-0.25..0.25f32);
        }
        device.memory().upload(scene.buffer.va(), bytemuck::cast_slice(&scene.values))?;

        let scratch = device.create_buffer(sizes.update_scratch_size.max(4))?;
        let info = BuildGeometryInfo {
            ty: AccelStructType::BottomLevel,
            flags: build_flags,
            mode: BuildMode::Update,
            src: blas.va(),
            dst: blas.va(),
            geometries: vec![scene.geometry],
            scratch: scratch.va(),
        };
        let ranges = [BuildRangeInfo {
            primitive_count: options.count,
            ..Default::default()
        }];
        let mut cmd = CommandBuffer::new(device.clone());
        cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges])?;
        cmd.submit()?;
        device.destroy_buffer(scratch.va())?;
        valid &= report(&device, "blas (refit)", &blas, kernel_flags, options.json)?;
    }

    if options.instances > 0 {
        let instances: Vec<InstanceInput> = (0..options.instances)
            .map(|i| {
                let mut transform = MAT3X4_IDENTITY;
                for row in 0..3 {
                    transform[row * 4 + 3] = rng.random_range(-500.0..500.0);
                }
                InstanceInput {
                    transform,
                    custom_instance_and_mask: (i & 0x00ff_ffff) | (0xff << 24),
                    sbt_offset_and_flags: 0,
                    acceleration_structure_reference: blas.va(),
                }
            })
            .collect();
        let buffer = device.create_buffer((instances.len() * std::mem::size_of::<InstanceInput>()) as u64)?;
        device.memory().upload(buffer.va(), bytemuck::cast_slice(&instances))?;
        let geometry = Geometry {
            kind: GeometryKind::Instances(InstancesData {
                array_of_pointers: false,
                data: buffer.va(),
            }),
            flags: GeometryFlags::empty(),
        };
        let tlas_flags = BuildAccelFlags::PREFER_FAST_TRACE;
        let (tlas, _) = build(&device, AccelStructType::TopLevel, geometry, options.instances, tlas_flags)?;
        valid &= report(&device, "tlas", &tlas, encode_flags(&config, tlas_flags), options.json)?;
    }

    if !valid {
        bail!("validation failed");
    }
    Ok(())
}
