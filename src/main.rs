use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use rootcause::prelude::*;
use thiserror::Error;

use mffexport::format::reader::{LodData, MffFile, read_mff};
use mffexport::format::{FLAG_COMPRESSED_NORMALS, FLAG_DEFLATE, STATIC_KEYFRAME};

/// Print a summary of a binary MFF scene
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print the parsed file as JSON instead of a summary
    #[clap(short, long)]
    json: bool,

    /// List every instance with its transform
    #[clap(short, long)]
    instances: bool,

    /// .mff file(s)
    files: Vec<PathBuf>,
}

#[derive(Debug, Error)]
enum InfoError {
    #[error("failed to read {0}")]
    Io(String),
    #[error("failed to parse {0}")]
    Parse(String),
    #[error("failed to serialize {0}")]
    Json(String),
}

fn load(path: &Path) -> Result<MffFile, Report<InfoError>> {
    let name = path.display().to_string();
    let data = fs::read(path).map_err(|e| Report::new(e).context(InfoError::Io(name.clone())))?;
    read_mff(&data).context(InfoError::Parse(name))
}

fn print_summary(path: &Path, file: &MffFile, instances: bool) {
    println!("{}", path.display());
    let mut flags = Vec::new();
    if file.flags & FLAG_DEFLATE != 0 {
        flags.push("deflate");
    }
    if file.flags & FLAG_COMPRESSED_NORMALS != 0 {
        flags.push("compressed normals");
    }
    println!("  flags: {}", if flags.is_empty() { "none".to_string() } else { flags.join(", ") });
    println!("  materials ({}): {}", file.materials.len(), file.materials.join(", "));
    println!(
        "  bones: {} x {} keyframes",
        file.bones.bone_count, file.bones.keyframes
    );

    println!("  objects ({}):", file.objects.len());
    for (i, object) in file.objects.iter().enumerate() {
        let keyframe = if object.keyframe == STATIC_KEYFRAME {
            "static".to_string()
        } else {
            format!("keyframe {}", object.keyframe)
        };
        println!("    [{i}] {} ({keyframe}, {} LODs)", object.name, object.lods.len());
        for (level, lod) in object.lods.iter().enumerate() {
            match &lod.data {
                LodData::Sphere { radius, .. } => {
                    println!("      LOD {level}: sphere r={radius}");
                }
                LodData::Mesh(_) => println!(
                    "      LOD {level}: {} vertices, {} triangles, {} quads, {} attributes",
                    lod.vertices,
                    lod.triangles,
                    lod.quads,
                    lod.vertex_attributes + lod.face_attributes,
                ),
            }
        }
    }

    println!("  instances: {}", file.instances.len());
    if instances {
        for instance in &file.instances {
            println!("    {} -> object {}", instance.name, instance.object);
            for row in &instance.rows {
                println!("      {row:?}");
            }
        }
    }
}

fn main() -> Result<(), Report<InfoError>> {
    let args = Args::parse();

    for path in &args.files {
        let file = load(path)?;
        if args.json {
            let text = serde_json::to_string_pretty(&file).map_err(|e| {
                Report::new(e).context(InfoError::Json(path.display().to_string()))
            })?;
            println!("{text}");
        } else {
            print_summary(path, &file, args.instances);
        }
    }

    Ok(())
}
