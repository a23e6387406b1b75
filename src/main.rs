use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use dicom_rt_scene::{FrameRegistry, ImportOptions, Importer, MemorySink};
use log::{error, info};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [kind, path] = args.as_slice() else {
        eprintln!("usage: dicom-rt-scene <ct|dose|struct|ion> <file.dcm>");
        return ExitCode::FAILURE;
    };
    let path = PathBuf::from(path);

    let mut importer = Importer::new(
        MemorySink::new(),
        Arc::new(FrameRegistry::new()),
        ImportOptions::default(),
    );
    let result = match kind.as_str() {
        "ct" => importer.import_image_series(&path),
        "dose" => importer.import_dose(&path),
        "struct" => importer.import_structures(&path),
        "ion" => importer.import_ion_plan(&path),
        other => {
            eprintln!("unknown import kind {other}, expected ct, dose, struct or ion");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(report) => {
            let sink = importer.sink();
            for volume in &sink.volumes {
                info!(
                    "volume {}: dims {:?}, spacing {:?} m",
                    volume.handle.name,
                    volume.voxels.dim(),
                    volume.spacing_m
                );
            }
            for points in &sink.point_sets {
                info!("point set {}: {} points", points.handle.name, points.points.len());
            }
            info!(
                "{} import produced {} object(s), frame {:?}, anchored: {}",
                report.kind.label(),
                report.handles.len(),
                report.frame_uid,
                report.anchored
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err.user_message());
            ExitCode::FAILURE
        }
    }
}
