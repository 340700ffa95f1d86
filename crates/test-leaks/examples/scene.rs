use eyre::Result;
use memtrail::{Format, InvalidRelease, Tracker};
use test_leaks::{clean_all, LineReader, MapGrid, Rgb, Scene, Side, Textures};
use tracing_subscriber::EnvFilter;

const MAP: [&str; 5] = ["111111", "100101", "101001", "1100N1", "111111"];

#[inline(never)]
fn parse_scene(tracker: &Tracker) -> Result<Scene> {
    let mut textures = Textures::new();
    textures.set_path(tracker, Side::North, "./textures/north.xpm")?;
    textures.set_path(tracker, Side::South, "./textures/south.xpm")?;
    textures.set_path(tracker, Side::West, "./textures/west.xpm")?;
    textures.set_path(tracker, Side::East, "./textures/east.xpm")?;
    // duplicate identifier in the scene file: the first copy is lost
    textures.set_path(tracker, Side::East, "./textures/east_alt.xpm")?;
    textures.floor = Rgb::new(220, 100, 0);
    textures.ceiling = Rgb::new(225, 30, 0);

    let map = MapGrid::from_lines(tracker, &MAP)?;
    Ok(Scene { map, textures })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let tracker = Tracker::builder()
        .format(Format::Table)
        .invalid_release(InvalidRelease::Skip)
        .build();

    let mut scene = parse_scene(&tracker)?;
    tracing::info!(rows = scene.map.height(), "scene parsed");

    let mut reader = LineReader::new();
    clean_all(&tracker, Some(&mut scene), -1, &mut reader);

    tracker.shutdown();
    Ok(())
}
