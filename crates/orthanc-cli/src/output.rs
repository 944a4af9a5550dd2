use orthanc_store::Statistics;

/// Render storage statistics as the human-readable summary printed once at
/// startup and once more on graceful shutdown.
pub fn render_statistics(stats: &Statistics) -> String {
    format!(
        "patients: {}\nstudies: {}\nseries: {}\ninstances: {}\nuncompressed size: {} bytes\ncompressed size: {} bytes\n",
        stats.patients,
        stats.studies,
        stats.series,
        stats.instances,
        stats.total_uncompressed_size,
        stats.total_compressed_size,
    )
}
