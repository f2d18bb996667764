//! Append-only HDF5 frame store with NeXus-style metadata.
//!
//! # Layout
//!
//! ```text
//! /entry                                  NX_class = NXentry
//!   /data                                 NX_class = NXdata
//!     data_000001      (n, rows, cols)    frame axis unlimited, one-frame chunks
//!                                         attrs image_nr_low = 1, image_nr_high = n
//!     frame_numbers    (n,) int64         always as long as data_000001
//!   /instrument                           NX_class = NXinstrument
//!     /detector                           NX_class = NXdetector
//!       x_pixel_size, y_pixel_size        metres
//!       /detectorSpecific
//!         pixel_mask   (rows, cols) uint32, all zero
//!         x_pixels_in_detector, y_pixels_in_detector
//!         nimages                         written by close() only
//! ```
//!
//! A store without `nimages` is, by convention, a partial file.

use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii};
use hdf5::{Dataset, File, Group};
use ndarray::{arr1, s, Array2};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{FrameConfig, StoreConfig};
use crate::error::{StreamError, StreamResult};
use crate::frame::{Frame, Image, Pixel, PixelType, Pixels};

/// Path of the image dataset.
pub const IMAGES_PATH: &str = "entry/data/data_000001";
/// Path of the frame id dataset.
pub const FRAME_NUMBERS_PATH: &str = "entry/data/frame_numbers";
/// Path of the image count written at finalize.
pub const NIMAGES_PATH: &str = "entry/instrument/detector/detectorSpecific/nimages";

/// Binds `$t` to the Rust element type of a [`PixelType`] inside `$body`.
macro_rules! with_element_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            PixelType::U8 => {
                type $t = u8;
                $body
            }
            PixelType::U16 => {
                type $t = u16;
                $body
            }
            PixelType::U32 => {
                type $t = u32;
                $body
            }
            PixelType::U64 => {
                type $t = u64;
                $body
            }
            PixelType::I8 => {
                type $t = i8;
                $body
            }
            PixelType::I16 => {
                type $t = i16;
                $body
            }
            PixelType::I32 => {
                type $t = i32;
                $body
            }
            PixelType::I64 => {
                type $t = i64;
                $body
            }
            PixelType::F32 => {
                type $t = f32;
                $body
            }
            PixelType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Store open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Create (truncate) and append frames
    Write,
    /// Read an existing store sequentially
    Read,
}

impl FromStr for StoreMode {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "w" => Ok(StoreMode::Write),
            "r" => Ok(StoreMode::Read),
            other => Err(StreamError::Config(format!(
                "Unknown store mode '{other}'. Must be 'w' or 'r'"
            ))),
        }
    }
}

struct Handle {
    file: File,
    images: Dataset,
    frame_numbers: Dataset,
}

/// HDF5 frame store.
///
/// Single writer only: one open handle per path, never shared between callers.
pub struct FrameStore {
    path: PathBuf,
    mode: StoreMode,
    handle: Option<Handle>,
    shape: (usize, usize),
    dtype: PixelType,
    n_frames: usize,
    cursor: usize,
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("n_frames", &self.n_frames)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

fn set_nx_class(group: &Group, class: &str) -> StreamResult<()> {
    write_str_attr(group, "NX_class", class)
}

fn write_str_attr(location: &hdf5::Location, name: &str, value: &str) -> StreamResult<()> {
    let value = VarLenAscii::from_ascii(value).map_err(|e| StreamError::StoreLayout(e.to_string()))?;
    location.new_attr::<VarLenAscii>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn scalar_dataset<T: hdf5::H5Type>(group: &Group, name: &str, value: T) -> StreamResult<Dataset> {
    let dataset = group.new_dataset::<T>().shape(()).create(name)?;
    dataset.write_scalar(&value)?;
    Ok(dataset)
}

fn pixel_type_of(dataset: &Dataset) -> StreamResult<PixelType> {
    let descriptor = dataset.dtype()?.to_descriptor()?;
    let dtype = match descriptor {
        TypeDescriptor::Unsigned(IntSize::U1) => PixelType::U8,
        TypeDescriptor::Unsigned(IntSize::U2) => PixelType::U16,
        TypeDescriptor::Unsigned(IntSize::U4) => PixelType::U32,
        TypeDescriptor::Unsigned(IntSize::U8) => PixelType::U64,
        TypeDescriptor::Integer(IntSize::U1) => PixelType::I8,
        TypeDescriptor::Integer(IntSize::U2) => PixelType::I16,
        TypeDescriptor::Integer(IntSize::U4) => PixelType::I32,
        TypeDescriptor::Integer(IntSize::U8) => PixelType::I64,
        TypeDescriptor::Float(FloatSize::U4) => PixelType::F32,
        TypeDescriptor::Float(FloatSize::U8) => PixelType::F64,
        other => {
            return Err(StreamError::StoreLayout(format!(
                "unsupported image element type {other:?}"
            )))
        }
    };
    Ok(dtype)
}

impl FrameStore {
    /// Open a store by mode string (`"w"` or `"r"`).
    ///
    /// `frame` and `store` are only used in write mode; read mode takes the geometry
    /// from the file and creates nothing.
    pub fn open<P: AsRef<Path>>(path: P, mode: &str, frame: &FrameConfig, store: &StoreConfig) -> StreamResult<Self> {
        match mode.parse::<StoreMode>()? {
            StoreMode::Write => Self::create(path, frame, store),
            StoreMode::Read => Self::open_read(path),
        }
    }

    /// Create a new store, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, frame: &FrameConfig, store: &StoreConfig) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (rows, cols) = frame.shape();
        let file = File::create(&path)?;

        let entry = file.create_group("entry")?;
        set_nx_class(&entry, "NXentry")?;
        let data = entry.create_group("data")?;
        set_nx_class(&data, "NXdata")?;

        let images = with_element_type!(frame.dtype, T => data
            .new_dataset::<T>()
            .shape((0.., rows, cols))
            .chunk((1, rows, cols))
            .create("data_000001")?);
        images.new_attr::<i32>().create("image_nr_low")?.write_scalar(&1i32)?;
        images.new_attr::<i32>().create("image_nr_high")?.write_scalar(&0i32)?;

        let frame_numbers = data
            .new_dataset::<i64>()
            .shape(0..)
            .chunk(1024)
            .create("frame_numbers")?;

        let instrument = entry.create_group("instrument")?;
        set_nx_class(&instrument, "NXinstrument")?;
        let detector = instrument.create_group("detector")?;
        set_nx_class(&detector, "NXdetector")?;
        for (name, size) in [("x_pixel_size", store.x_pixel_size), ("y_pixel_size", store.y_pixel_size)] {
            let dataset = scalar_dataset(&detector, name, size)?;
            write_str_attr(&dataset, "units", "m")?;
        }

        let specific = detector.create_group("detectorSpecific")?;
        specific
            .new_dataset::<u32>()
            .shape((rows, cols))
            .create("pixel_mask")?
            .write(&Array2::<u32>::zeros((rows, cols)))?;
        scalar_dataset(&specific, "x_pixels_in_detector", cols as u32)?;
        scalar_dataset(&specific, "y_pixels_in_detector", rows as u32)?;

        tracing::info!(path = %path.display(), rows, cols, dtype = %frame.dtype, "Created frame store");

        Ok(Self {
            path,
            mode: StoreMode::Write,
            handle: Some(Handle {
                file,
                images,
                frame_numbers,
            }),
            shape: (rows, cols),
            dtype: frame.dtype,
            n_frames: 0,
            cursor: 0,
        })
    }

    /// Open an existing store for sequential reading.
    pub fn open_read<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let images = file.dataset(IMAGES_PATH)?;
        let frame_numbers = file.dataset(FRAME_NUMBERS_PATH)?;

        let shape = match images.shape().as_slice() {
            [_, rows, cols] => (*rows, *cols),
            other => {
                return Err(StreamError::StoreLayout(format!(
                    "image dataset must have rank 3, found shape {other:?}"
                )))
            }
        };
        let dtype = pixel_type_of(&images)?;

        let n_images = images.shape()[0];
        let n_ids = frame_numbers.size();
        if n_images != n_ids {
            tracing::warn!(n_images, n_ids, path = %path.display(), "Image and frame id counts differ");
        }

        Ok(Self {
            path,
            mode: StoreMode::Read,
            handle: Some(Handle {
                file,
                images,
                frame_numbers,
            }),
            shape,
            dtype,
            n_frames: n_images.min(n_ids),
            cursor: 0,
        })
    }

    fn handle(&self) -> StreamResult<&Handle> {
        self.handle
            .as_ref()
            .ok_or_else(|| StreamError::StoreLayout(format!("store {} is closed", self.path.display())))
    }

    /// Append one frame. The image must already be of the store's pixel type.
    pub fn write(&mut self, image: &Image, frame_id: i64) -> StreamResult<()> {
        if self.mode != StoreMode::Write {
            return Err(StreamError::StoreLayout("store is open read-only".into()));
        }
        if image.shape() != self.shape {
            return Err(StreamError::Shape {
                expected: self.shape,
                actual: image.shape(),
            });
        }
        if image.dtype() != self.dtype {
            return Err(StreamError::StoreLayout(format!(
                "image is {}, store holds {}",
                image.dtype(),
                self.dtype
            )));
        }

        let handle = self.handle()?;
        let n = self.n_frames;
        if let Err(e) = append_frame(handle, self.dtype, self.shape, image, frame_id, n) {
            // both datasets go back to n frames so they never disagree in length
            let (rows, cols) = self.shape;
            if let Err(rollback) = handle.images.resize((n, rows, cols)) {
                tracing::warn!(error = %rollback, n, "Failed to roll back image dataset");
            }
            if let Err(rollback) = handle.frame_numbers.resize(n) {
                tracing::warn!(error = %rollback, n, "Failed to roll back frame_numbers");
            }
            return Err(e);
        }

        self.n_frames = n + 1;
        Ok(())
    }

    /// Read the frame under the cursor and advance.
    pub fn read(&mut self) -> StreamResult<Frame> {
        if self.cursor >= self.n_frames {
            return Err(StreamError::EndOfStore);
        }
        let handle = self.handle()?;
        let index = self.cursor;

        let pixels = with_element_type!(self.dtype, T => {
            let values = handle.images.read_slice_2d::<T, _>(s![index, .., ..])?;
            <T as Pixel>::wrap(values.iter().copied().collect())
        });
        let ids = handle.frame_numbers.read_slice_1d::<i64, _>(s![index..index + 1])?;
        let frame_id = ids
            .first()
            .copied()
            .ok_or_else(|| StreamError::StoreLayout(format!("missing frame number {index}")))?;

        let (rows, cols) = self.shape;
        let image = Image::new(rows, cols, pixels)?;
        self.cursor += 1;
        Ok(Frame::new(image, frame_id))
    }

    /// Move the read cursor. Positions past the last frame are rejected.
    pub fn seek(&mut self, index: usize) -> StreamResult<()> {
        if index > self.n_frames {
            return Err(StreamError::StoreLayout(format!(
                "seek to {index} beyond {} frames",
                self.n_frames
            )));
        }
        self.cursor = index;
        Ok(())
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    /// Frames written (write mode) or available (read mode).
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Current length of the frame id dataset.
    pub fn frame_numbers_len(&self) -> StreamResult<usize> {
        Ok(self.handle()?.frame_numbers.size())
    }

    /// All frame ids in the store.
    pub fn frame_numbers(&self) -> StreamResult<Vec<i64>> {
        Ok(self.handle()?.frame_numbers.read_raw::<i64>()?)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn dtype(&self) -> PixelType {
        self.dtype
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Finalize and close. Safe to call more than once.
    ///
    /// In write mode with at least one frame written, records `nimages` first.
    pub fn close(&mut self) -> StreamResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if self.mode == StoreMode::Write && self.n_frames > 0 && !handle.file.link_exists(NIMAGES_PATH) {
            let specific = handle.file.group("entry/instrument/detector/detectorSpecific")?;
            scalar_dataset(&specific, "nimages", self.n_frames as u64)?;
            handle.file.flush()?;
            tracing::info!(path = %self.path.display(), n_frames = self.n_frames, "Finalized frame store");
        }
        Ok(())
    }
}

/// Grow both datasets to `n + 1` and fill the new slot.
fn append_frame(
    handle: &Handle,
    dtype: PixelType,
    (rows, cols): (usize, usize),
    image: &Image,
    frame_id: i64,
    n: usize,
) -> StreamResult<()> {
    handle.images.resize((n + 1, rows, cols))?;
    with_element_type!(dtype, T => {
        let view = image
            .view::<T>()
            .ok_or_else(|| StreamError::StoreLayout(format!("image is not {}", <T as Pixel>::DTYPE)))?;
        handle.images.write_slice(view, s![n, .., ..])?;
    });

    handle.frame_numbers.resize(n + 1)?;
    handle.frame_numbers.write_slice(&arr1(&[frame_id]), s![n..n + 1])?;

    let high = i32::try_from(n + 1).unwrap_or(i32::MAX);
    handle.images.attr("image_nr_high")?.write_scalar(&high)?;
    Ok(())
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to close frame store");
        }
    }
}

/// Write an accumulated image to its own HDF5 file as `entry/data/data`.
pub fn write_summed_image<P: AsRef<Path>>(path: P, image: &Image, frames: usize, complete: bool) -> StreamResult<()> {
    let file = File::create(path.as_ref())?;
    let entry = file.create_group("entry")?;
    set_nx_class(&entry, "NXentry")?;
    let data = entry.create_group("data")?;
    set_nx_class(&data, "NXdata")?;

    let (rows, cols) = image.shape();
    let dataset = with_element_type!(image.dtype(), T => {
        let view = image
            .view::<T>()
            .ok_or_else(|| StreamError::StoreLayout(format!("image is not {}", <T as Pixel>::DTYPE)))?;
        let dataset = data.new_dataset::<T>().shape((rows, cols)).create("data")?;
        dataset.write(view)?;
        dataset
    });
    dataset.new_attr::<u64>().create("frames")?.write_scalar(&(frames as u64))?;
    dataset.new_attr::<u8>().create("complete")?.write_scalar(&u8::from(complete))?;
    file.flush()?;
    Ok(())
}

/// Read back an image written by [`write_summed_image`] as float64.
pub fn read_summed_image<P: AsRef<Path>>(path: P) -> StreamResult<(Image, u64, bool)> {
    let file = File::open(path.as_ref())?;
    let dataset = file.dataset("entry/data/data")?;
    let values = dataset.read_2d::<f64>()?;
    let (rows, cols) = values.dim();
    let image = Image::new(rows, cols, Pixels::F64(values.iter().copied().collect()))?;
    let frames = dataset.attr("frames")?.read_scalar::<u64>()?;
    let complete = dataset.attr("complete")?.read_scalar::<u8>()? != 0;
    Ok((image, frames, complete))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings() {
        assert_eq!("w".parse::<StoreMode>().unwrap(), StoreMode::Write);
        assert_eq!("r".parse::<StoreMode>().unwrap(), StoreMode::Read);
        assert!(matches!("a".parse::<StoreMode>(), Err(StreamError::Config(_))));
    }

    #[test]
    fn test_frame_numbers_track_images() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("frames.h5");
        let frame = FrameConfig {
            dtype: PixelType::U16,
            rows: 3,
            cols: 4,
        };

        let mut store = FrameStore::create(&path, &frame, &StoreConfig::default()).unwrap();
        for id in [10, 11, 13] {
            let image = Image::from_vec(3, 4, vec![id as u16; 12]).unwrap();
            store.write(&image, id).unwrap();
            assert_eq!(store.n_frames(), store.frame_numbers_len().unwrap());
        }
        assert_eq!(store.frame_numbers().unwrap(), vec![10, 11, 13]);
        store.close().unwrap();
    }

    #[test]
    fn test_failed_append_keeps_datasets_aligned() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("frames.h5");
        let frame = FrameConfig {
            dtype: PixelType::U16,
            rows: 3,
            cols: 4,
        };
        let mut store = FrameStore::create(&path, &frame, &StoreConfig::default()).unwrap();
        let image = Image::from_vec(3, 4, vec![1u16; 12]).unwrap();
        store.write(&image, 1).unwrap();

        // a fixed-size id dataset cannot grow, so the append fails after the images grew
        let handle = store.handle.as_mut().unwrap();
        let fixed = handle.file.new_dataset::<i64>().shape(1).create("fixed_ids").unwrap();
        let ids = std::mem::replace(&mut handle.frame_numbers, fixed);

        assert!(store.write(&image, 2).is_err());
        let handle = store.handle.as_mut().unwrap();
        assert_eq!(handle.images.shape(), vec![1, 3, 4]);
        handle.frame_numbers = ids;
        assert_eq!(store.n_frames(), 1);

        store.write(&image, 3).unwrap();
        assert_eq!(store.frame_numbers().unwrap(), vec![1, 3]);
        assert_eq!(store.frame_numbers_len().unwrap(), 2);
        store.close().unwrap();
    }
}
