use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use ndarray::Array4;
use serde_json::json;

/// Destination for per-step scalars and rendered evaluation images.
pub trait TrainSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> io::Result<()>;

    /// Records a batch of RGB images, `[N, 3, H, W]` with `u8` channels.
    fn add_images(&mut self, tag: &str, images: &Array4<u8>, step: usize) -> io::Result<()>;
}

/// Discards everything. Used by tests that only care about training math.
pub struct NullSink;

impl TrainSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f32, _step: usize) -> io::Result<()> {
        Ok(())
    }

    fn add_images(&mut self, _tag: &str, _images: &Array4<u8>, _step: usize) -> io::Result<()> {
        Ok(())
    }
}

/// Appends scalar events as JSON lines and drops rendered images next to
/// them as binary PPM files.
pub struct JsonlSink {
    events: BufWriter<File>,
    image_dir: PathBuf,
}

impl JsonlSink {
    pub fn create(runs_dir: &std::path::Path, run_name: &str) -> io::Result<Self> {
        fs::create_dir_all(runs_dir)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(runs_dir.join(format!("{run_name}.jsonl")))?;
        let image_dir = runs_dir.join(format!("{run_name}_images"));
        fs::create_dir_all(&image_dir)?;
        Ok(Self {
            events: BufWriter::new(events),
            image_dir,
        })
    }

    fn image_path(&self, tag: &str, step: usize, slot: usize) -> PathBuf {
        let safe_tag = tag.replace('/', "-");
        self.image_dir.join(format!("{safe_tag}_{step}_{slot}.ppm"))
    }
}

impl TrainSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> io::Result<()> {
        let event = json!({ "kind": "scalar", "tag": tag, "step": step, "value": value });
        writeln!(self.events, "{event}")?;
        self.events.flush()
    }

    fn add_images(&mut self, tag: &str, images: &Array4<u8>, step: usize) -> io::Result<()> {
        let (n, channels, height, width) = images.dim();
        debug_assert_eq!(channels, 3, "image batches must be RGB");
        let mut paths = Vec::with_capacity(n);
        for slot in 0..n {
            let path = self.image_path(tag, step, slot);
            let mut pixels = Vec::with_capacity(3 * height * width);
            for h in 0..height {
                for w in 0..width {
                    pixels.push(images[[slot, 0, h, w]]);
                    pixels.push(images[[slot, 1, h, w]]);
                    pixels.push(images[[slot, 2, h, w]]);
                }
            }
            let mut file = BufWriter::new(File::create(&path)?);
            write!(file, "P6\n{width} {height}\n255\n")?;
            file.write_all(&pixels)?;
            file.flush()?;
            paths.push(path.display().to_string());
        }
        let event = json!({ "kind": "images", "tag": tag, "step": step, "paths": paths });
        writeln!(self.events, "{event}")?;
        self.events.flush()
    }
}
