use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use nifti::{NiftiHeader, NiftiObject, NiftiVolume, RandomAccessNiftiVolume, ReaderOptions};

use crate::error::SpiderError;
use crate::timed::{TimedWriter, announce};

const SWAP_AXES: [&str; 3] = ["x", "y", "z"];

/// Plane shown when slices are picked explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    /// Voxel axis the slices are taken along.
    pub fn axis(self) -> usize {
        match self {
            Orientation::Sagittal => 0,
            Orientation::Coronal => 1,
            Orientation::Axial => 2,
        }
    }
}

impl FromStr for Orientation {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ax" | "axial" => Ok(Orientation::Axial),
            "cor" | "coronal" => Ok(Orientation::Coronal),
            "sag" | "sagittal" => Ok(Orientation::Sagittal),
            other => Err(SpiderError::Report(format!("unknown orientation '{other}'"))),
        }
    }
}

/// A single 3D volume held in memory, x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: [usize; 3],
    data: Vec<f32>,
}

/// A 2D cut through a volume; `at(i, j)` follows the volume's voxel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl Volume {
    pub fn from_data(dims: [usize; 3], data: Vec<f32>) -> Result<Self, SpiderError> {
        if dims.iter().product::<usize>() != data.len() || data.is_empty() {
            return Err(SpiderError::Report(format!(
                "volume of {dims:?} does not match {} values",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    /// Loads a 3D image, or one sub-volume of a 4D image (`volume_index`,
    /// by default the middle one). `volume_index` is ignored for 3D images.
    pub fn load(path: &Path, volume_index: Option<usize>) -> Result<Self, SpiderError> {
        let image_error = |message: String| SpiderError::Image {
            path: path.to_path_buf(),
            message,
        };
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|err| image_error(err.to_string()))?;
        let volume = object.into_volume();
        let shape = volume.dim().to_vec();
        if shape.len() < 3 {
            return Err(image_error(format!("expected a 3D or 4D image, got {shape:?}")));
        }
        let frames = shape.get(3).copied().unwrap_or(1) as usize;
        let frame = match volume_index {
            Some(index) if shape.len() > 3 => index,
            _ => frames / 2,
        };
        if frame >= frames {
            return Err(image_error(format!(
                "volume index {frame} out of range for {frames} volumes"
            )));
        }

        let dims = [shape[0] as usize, shape[1] as usize, shape[2] as usize];
        let mut coords = vec![0u16; shape.len()];
        if coords.len() > 3 {
            coords[3] = frame as u16;
        }
        let mut data = Vec::with_capacity(dims.iter().product());
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    coords[0] = x as u16;
                    coords[1] = y as u16;
                    coords[2] = z as u16;
                    let value = volume
                        .get_f32(&coords)
                        .map_err(|err| image_error(err.to_string()))?;
                    data.push(value);
                }
            }
        }
        Self::from_data(dims, data)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[x + self.dims[0] * (y + self.dims[1] * z)]
    }

    pub fn middle_slice(&self, axis: usize) -> Result<Slice, SpiderError> {
        self.slice(axis, self.dims[axis] / 2)
    }

    pub fn slice(&self, axis: usize, index: usize) -> Result<Slice, SpiderError> {
        let Some(&extent) = self.dims.get(axis) else {
            return Err(SpiderError::Report(format!("no axis {axis} in a 3D volume")));
        };
        if index >= extent {
            return Err(SpiderError::Report(format!(
                "slice {index} out of range for axis of length {extent}"
            )));
        }
        let [nx, ny, nz] = self.dims;
        let (width, height) = match axis {
            0 => (ny, nz),
            1 => (nx, nz),
            _ => (nx, ny),
        };
        let mut values = Vec::with_capacity(width * height);
        for j in 0..height {
            for i in 0..width {
                let value = match axis {
                    0 => self.at(index, i, j),
                    1 => self.at(i, index, j),
                    _ => self.at(i, j, index),
                };
                values.push(value);
            }
        }
        Ok(Slice {
            width,
            height,
            values,
        })
    }

    /// `[n/4, n/2, 3n/4]` along `axis`.
    pub fn default_slices(&self, axis: usize) -> Vec<usize> {
        let n = self.dims.get(axis).copied().unwrap_or(0);
        vec![n / 4, n / 2, 3 * n / 4]
    }
}

impl Slice {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.values[i + self.width * j]
    }

    /// Value shown at display row `row`, column `col`: the slice transposed
    /// and turned by 180 degrees, so the first voxel axis runs right to left
    /// and the second bottom to top.
    pub fn display_at(&self, row: usize, col: usize) -> f32 {
        self.at(self.width - 1 - col, self.height - 1 - row)
    }

    pub fn range(&self) -> (f32, f32) {
        self.values
            .iter()
            .filter(|value| value.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &value| {
                (lo.min(value), hi.max(value))
            })
    }
}

/// Voxel-to-world rotation/scaling of an image: the qform when set, else
/// the sform, else the voxel sizes.
pub fn orientation_matrix(header: &NiftiHeader) -> [[f32; 3]; 3] {
    let pixdim = header.pixdim;
    if header.qform_code > 0 {
        let (b, c, d) = (header.quatern_b, header.quatern_c, header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let rotation = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let scale = [pixdim[1], pixdim[2], pixdim[3] * qfac];
        let mut matrix = [[0.0; 3]; 3];
        for (row, values) in rotation.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                matrix[row][col] = value * scale[col];
            }
        }
        return matrix;
    }
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        return rows.map(|row| [row[0], row[1], row[2]]);
    }
    [
        [pixdim[1], 0.0, 0.0],
        [0.0, pixdim[2], 0.0],
        [0.0, 0.0, pixdim[3]],
    ]
}

/// `fslswapdim` axis arguments that bring an image to the standard
/// orientation. For each voxel axis (column) the dominant world axis and
/// its sign are found; `None` when two columns share a dominant axis.
pub fn swapdim_args(matrix: &[[f32; 3]; 3]) -> Option<String> {
    let mut dominant = [0usize; 3];
    let mut flipped = [false; 3];
    for col in 0..3 {
        let row = (0..3)
            .max_by(|&a, &b| matrix[a][col].abs().total_cmp(&matrix[b][col].abs()))
            .unwrap_or(col);
        dominant[col] = row;
        flipped[col] = matrix[row][col] < 0.0;
    }
    let mut parts = Vec::with_capacity(3);
    for world in 0..3 {
        let col = dominant.iter().position(|&row| row == world)?;
        let sign = if flipped[col] { "-" } else { "" };
        parts.push(format!("{sign}{}", SWAP_AXES[col]));
    }
    Some(parts.join(" "))
}

/// Path `fslswapdim` writes to: `<dir>/<stem>_reorient.nii[.gz]`.
pub fn reoriented_path(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = if name.ends_with(".nii.gz") {
        ".nii.gz"
    } else {
        ".nii"
    };
    let stem = name.split('.').next().unwrap_or_default();
    image.with_file_name(format!("{stem}_reorient{ext}"))
}

/// Reorients `image` with `fslswapdim` when the tool is on `PATH`. Returns
/// the reoriented file, or `None` when no reorientation happened.
pub fn reorient(image: &Path, writer: Option<&TimedWriter>) -> Result<Option<PathBuf>, SpiderError> {
    let Ok(fslswapdim) = which::which("fslswapdim") else {
        return Ok(None);
    };
    let object = ReaderOptions::new()
        .read_file(image)
        .map_err(|err| SpiderError::Image {
            path: image.to_path_buf(),
            message: err.to_string(),
        })?;
    let Some(args) = swapdim_args(&orientation_matrix(object.header())) else {
        tracing::warn!(image = %image.display(), "ambiguous orientation, skipping reorientation");
        return Ok(None);
    };
    let target = reoriented_path(image);
    announce(
        writer,
        &format!(
            "INFO: command: fslswapdim {} {args} {}",
            image.display(),
            target.display()
        ),
    );
    let status = Command::new(fslswapdim)
        .arg(image)
        .args(args.split_whitespace())
        .arg(&target)
        .status()
        .map_err(|err| SpiderError::Command(format!("fslswapdim: {err}")))?;
    if !status.success() {
        tracing::warn!(image = %image.display(), %status, "fslswapdim failed, using original image");
        return Ok(None);
    }
    if target.exists() {
        return Ok(Some(target));
    }
    let gz = PathBuf::from(format!("{}.gz", target.display()));
    Ok(gz.exists().then_some(gz))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: [usize; 3]) -> Volume {
        let data = (0..dims.iter().product::<usize>()).map(|v| v as f32).collect();
        Volume::from_data(dims, data).unwrap()
    }

    #[test]
    fn swapdim_identity_and_flips() {
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(swapdim_args(&identity).as_deref(), Some("x y z"));

        let radiological = [[-2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]];
        assert_eq!(swapdim_args(&radiological).as_deref(), Some("-x y z"));

        // voxel axes stored as (y, z, x) in world space
        let permuted = [[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, -1.0, 0.0]];
        assert_eq!(swapdim_args(&permuted).as_deref(), Some("z x -y"));

        let degenerate = [[1.0, 1.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(swapdim_args(&degenerate), None);
    }

    #[test]
    fn reoriented_names() {
        assert_eq!(
            reoriented_path(Path::new("/data/t1.nii.gz")),
            PathBuf::from("/data/t1_reorient.nii.gz")
        );
        assert_eq!(
            reoriented_path(Path::new("/data/fmri.run1.nii")),
            PathBuf::from("/data/fmri_reorient.nii")
        );
    }

    #[test]
    fn slices_and_display_order() {
        let volume = ramp([4, 3, 2]);
        let axial = volume.slice(2, 1).unwrap();
        assert_eq!((axial.width(), axial.height()), (4, 3));
        assert_eq!(axial.at(0, 0), 12.0);
        assert_eq!(axial.display_at(0, 0), axial.at(3, 2));

        let sagittal = volume.middle_slice(0).unwrap();
        assert_eq!((sagittal.width(), sagittal.height()), (3, 2));
        assert_eq!(sagittal.at(1, 1), 2.0 + 4.0 + 12.0);

        assert!(volume.slice(2, 2).is_err());
        assert_eq!(volume.default_slices(0), vec![1, 2, 3]);
    }

    #[test]
    fn orientation_names() {
        assert_eq!("cor".parse::<Orientation>().unwrap().axis(), 1);
        assert_eq!(Orientation::default().axis(), 2);
        assert!("oblique".parse::<Orientation>().is_err());
    }
}
