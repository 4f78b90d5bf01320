//! Native binary map format.
//!
//! The format is self-describing: a reader on a different layout can
//! reject the file or project it through
//! [`MapLayout::calculate_overlapping_layer_set`]. All integers are
//! little-endian; floats are IEEE-754.
//!
//! Layout:
//! - Magic: `"GHANAMAP"` (8 bytes)
//! - Version: u32
//! - Map header:
//!   - Origin: 3 x f64
//!   - Resolution: f64
//!   - Region dimensions: 3 x u8, padded to 8 bytes
//!   - Hit / miss / min / max / occupancy threshold values: 5 x f32
//!   - Flags: u32 (reserved, zero)
//! - Layout block: layer count u32; per layer: name (u32 length + UTF-8),
//!   subsampling u8, member count u32; per member: name, type tag u8,
//!   clear pattern (8 bytes)
//! - Region block: region count u32; per region: region key 3 x i16,
//!   region origin 3 x f64, timestamps 2 x f64 (first-ray, touched), then
//!   each layer's voxel bytes in layer order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::core::{Point3, RegionKey, RegionSize};
use crate::error::{Error, Result};
use crate::layout::{DataType, MapLayout};
use crate::map::{OccupancyConfig, OccupancyMap};

/// Magic bytes of the map format.
pub const MAGIC: &[u8; 8] = b"GHANAMAP";

/// Current format version.
pub const VERSION: u32 = 1;

/// Progress collaborator for long (de)serialisations.
///
/// `set_target` is called once with the number of regions, `increment`
/// after each region. A true `should_quit` aborts the operation with
/// [`Error::Aborted`].
pub trait SerialiseProgress {
    /// Announce the total number of progress steps.
    fn set_target(&mut self, target: usize);
    /// Advance progress by `amount` steps.
    fn increment(&mut self, amount: usize);
    /// Poll for cooperative abort.
    fn should_quit(&self) -> bool {
        false
    }
}

/// Save a map to a file.
pub fn save_map<P: AsRef<Path>>(
    map: &OccupancyMap,
    path: P,
    progress: Option<&mut dyn SerialiseProgress>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_map(map, &mut writer, progress)?;
    writer.flush()?;
    Ok(())
}

/// Load a map from a file.
pub fn load_map<P: AsRef<Path>>(
    path: P,
    progress: Option<&mut dyn SerialiseProgress>,
) -> Result<OccupancyMap> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_map(&mut reader, progress)
}

/// Write a map to a writer.
pub fn write_map<W: Write>(
    map: &OccupancyMap,
    writer: &mut W,
    mut progress: Option<&mut dyn SerialiseProgress>,
) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;

    // Map header.
    let origin = map.origin();
    for component in [origin.x, origin.y, origin.z, map.resolution()] {
        writer.write_all(&component.to_le_bytes())?;
    }
    let dim = map.region_dim();
    writer.write_all(&[dim.x, dim.y, dim.z, 0, 0, 0, 0, 0])?;
    for value in [
        map.hit_value(),
        map.miss_value(),
        map.min_value(),
        map.max_value(),
        map.occupancy_threshold_value(),
    ] {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.write_all(&0u32.to_le_bytes())?;

    write_layout(map.layout(), writer)?;

    // Region block.
    let region_count = map.region_count();
    writer.write_all(&(region_count as u32).to_le_bytes())?;
    if let Some(progress) = progress.as_deref_mut() {
        progress.set_target(region_count);
    }

    for chunk in map.chunks() {
        if let Some(progress) = progress.as_deref_mut() {
            if progress.should_quit() {
                return Err(Error::Aborted);
            }
        }

        let key = chunk.region_key();
        for component in [key.x, key.y, key.z] {
            writer.write_all(&component.to_le_bytes())?;
        }
        let origin = chunk.origin();
        for component in [origin.x, origin.y, origin.z] {
            writer.write_all(&component.to_le_bytes())?;
        }
        writer.write_all(&chunk.first_ray_time().unwrap_or(0.0).to_le_bytes())?;
        writer.write_all(&chunk.touched_time().to_le_bytes())?;
        for layer in 0..chunk.layer_count() {
            writer.write_all(chunk.layer_bytes(layer))?;
        }

        if let Some(progress) = progress.as_deref_mut() {
            progress.increment(1);
        }
    }
    log::debug!("serialised {} regions", region_count);
    Ok(())
}

fn write_layout<W: Write>(layout: &MapLayout, writer: &mut W) -> Result<()> {
    writer.write_all(&(layout.layer_count() as u32).to_le_bytes())?;
    for layer in layout.layers() {
        write_string(layer.name(), writer)?;
        writer.write_all(&[layer.subsampling() as u8])?;
        let voxel = layer.voxel_layout();
        writer.write_all(&(voxel.member_count() as u32).to_le_bytes())?;
        for member in voxel.members() {
            write_string(member.name(), writer)?;
            writer.write_all(&[member.data_type().tag()])?;
            writer.write_all(&member.clear_pattern())?;
        }
    }
    Ok(())
}

fn write_string<W: Write>(value: &str, writer: &mut W) -> Result<()> {
    writer.write_all(&(value.len() as u32).to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Read a map from a reader.
pub fn read_map<R: Read>(
    reader: &mut R,
    mut progress: Option<&mut dyn SerialiseProgress>,
) -> Result<OccupancyMap> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::BadFormat("bad magic".into()));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    // Map header.
    let origin = Point3::new(read_f64(reader)?, read_f64(reader)?, read_f64(reader)?);
    let resolution = read_f64(reader)?;
    let mut dim_bytes = [0u8; 8];
    reader.read_exact(&mut dim_bytes)?;
    let region_dim = RegionSize::new(dim_bytes[0], dim_bytes[1], dim_bytes[2]);
    let hit_value = read_f32(reader)?;
    let miss_value = read_f32(reader)?;
    let min_value = read_f32(reader)?;
    let max_value = read_f32(reader)?;
    let threshold_value = read_f32(reader)?;
    let _flags = read_u32(reader)?;

    let layout = read_layout(reader)?;

    let mut map = OccupancyMap::with_config(OccupancyConfig {
        resolution,
        region_dim,
        origin,
        ..OccupancyConfig::default()
    })?;
    map.restore_value_parameters(hit_value, miss_value, min_value, max_value, threshold_value);
    map.set_layout(layout)?;

    // Region block.
    let region_count = read_u32(reader)? as usize;
    if let Some(progress) = progress.as_deref_mut() {
        progress.set_target(region_count);
    }

    for _ in 0..region_count {
        if let Some(progress) = progress.as_deref_mut() {
            if progress.should_quit() {
                return Err(Error::Aborted);
            }
        }

        let key = RegionKey::new(read_i16(reader)?, read_i16(reader)?, read_i16(reader)?);
        // The region origin is derivable from the key; read and discard.
        for _ in 0..3 {
            read_f64(reader)?;
        }
        let first_ray = read_f64(reader)?;
        let touched = read_f64(reader)?;

        let chunk = map
            .region_mut(key, true)?
            .ok_or_else(|| Error::BadFormat("unreadable region key".into()))?;
        for layer in 0..chunk.layer_count() {
            reader.read_exact(chunk.layer_bytes_mut(layer))?;
            chunk.clear_dirty(layer);
        }
        chunk.restore_times(touched, (first_ray != 0.0).then_some(first_ray));

        if let Some(progress) = progress.as_deref_mut() {
            progress.increment(1);
        }
    }
    log::debug!("deserialised {} regions", region_count);
    Ok(map)
}

fn read_layout<R: Read>(reader: &mut R) -> Result<MapLayout> {
    let layer_count = read_u32(reader)?;
    let mut layout = MapLayout::new();
    for _ in 0..layer_count {
        let name = read_string(reader)?;
        let mut subsampling = [0u8; 1];
        reader.read_exact(&mut subsampling)?;
        let member_count = read_u32(reader)?;
        let layer = layout.add_layer(&name, u16::from(subsampling[0]));
        for _ in 0..member_count {
            let member_name = read_string(reader)?;
            let mut tag = [0u8; 1];
            reader.read_exact(&mut tag)?;
            let data_type = DataType::from_tag(tag[0])
                .ok_or_else(|| Error::BadFormat(format!("unknown member type tag {}", tag[0])))?;
            let mut clear = [0u8; 8];
            reader.read_exact(&mut clear)?;
            layer
                .voxel_layout_mut()
                .add_member(&member_name, data_type, u64::from_le_bytes(clear));
        }
    }
    Ok(layout)
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let length = read_u32(reader)? as usize;
    if length > 64 * 1024 {
        return Err(Error::BadFormat(format!("string length {} too large", length)));
    }
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::BadFormat("string is not UTF-8".into()))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i16<R: Read>(reader: &mut R) -> Result<i16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(i16::from_le_bytes(bytes))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}
