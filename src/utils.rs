// Value-range conversions between stored images and the noising range, plus
// image loading with the offending path attached to errors.
use crate::error::{Error, Result};
use std::path::Path;
use tch::{Kind, Tensor};

/// Maps a `[0, 255]` image to `[0, 1]`.
pub fn int_to_float_img(img: &Tensor) -> Tensor {
    img.to_kind(Kind::Float) / 255.
}

/// Maps a `[0, 1]` image to `[-1, 1]`, the range noising works in.
pub fn scale_img(img: &Tensor) -> Tensor {
    img * 2. - 1.
}

/// Maps a `[-1, 1]` image back to `[0, 1]`, clipping anything outside.
pub fn unscale_img(img: &Tensor) -> Tensor {
    ((img + 1.) / 2.).clamp(0., 1.)
}

/// Maps a `[-1, 1]` image to `u8` values, ready to be saved.
pub fn to_u8_img(img: &Tensor) -> Tensor {
    (unscale_img(img) * 255.).to_kind(Kind::Uint8)
}

/// Loads an image as a `[3, img_length, img_length]` float tensor in `[-1, 1]`.
pub fn load_image<P: AsRef<Path>>(path: P, img_length: i64) -> Result<Tensor> {
    let path = path.as_ref();
    let img = tch::vision::image::load_and_resize(path, img_length, img_length)
        .map_err(|source| Error::ImageLoad { path: path.to_path_buf(), source })?;
    Ok(scale_img(&int_to_float_img(&img)))
}

/// Saves a `[3, H, W]` image in `[-1, 1]`, the format is picked from the extension.
pub fn save_image<P: AsRef<Path>>(img: &Tensor, path: P) -> Result<()> {
    tch::vision::image::save(&to_u8_img(img), path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    #[test]
    fn range_conversions() {
        let img = Tensor::from_slice(&[0u8, 51, 255]);
        let float = int_to_float_img(&img);
        assert!(float.allclose(&Tensor::from_slice(&[0f32, 0.2, 1.]), 1e-6, 1e-6, false));
        let scaled = scale_img(&float);
        assert!(scaled.allclose(&Tensor::from_slice(&[-1f32, -0.6, 1.]), 1e-6, 1e-6, false));
        let back = unscale_img(&scaled);
        assert!(back.allclose(&float, 1e-6, 1e-6, false));
    }

    #[test]
    fn unscale_clips() {
        let img = Tensor::from_slice(&[-3f32, 0., 3.]);
        let unscaled = unscale_img(&img);
        assert_eq!(Vec::<f32>::try_from(&unscaled).unwrap(), vec![0., 0.5, 1.]);
        assert_eq!(Vec::<u8>::try_from(&to_u8_img(&img)).unwrap(), vec![0, 127, 255]);
    }

    #[test]
    fn missing_image() {
        let err = load_image("does/not/exist.png", 8).unwrap_err();
        match err {
            Error::ImageLoad { path, .. } => assert_eq!(path, Path::new("does/not/exist.png")),
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[test]
    fn save_and_load() {
        let dir = std::env::temp_dir().join(format!("diffusion-datagen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gray.png");
        let img = Tensor::zeros([3, 8, 8], kind::FLOAT_CPU);
        save_image(&img, &path).unwrap();
        let loaded = load_image(&path, 4).unwrap();
        assert_eq!(loaded.size(), vec![3, 4, 4]);
        // 0 maps to 127 when saved, which loads back just below zero.
        assert!(loaded.abs().max().double_value(&[]) < 0.01);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
