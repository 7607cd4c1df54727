use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use tracing::debug;

use crate::error::CompileError;
use crate::mask::{image_dimensions, letterbox_reference, rasterize_mask};
use crate::payload::*;
use crate::transport::ReferenceEncoder;
use crate::types::{CharacterCaption, GenerationMode, GenerationParameters};

/// Appended to the base model id for inpainting.
pub const INPAINT_SUFFIX: &str = "-inpainting";

/// Top-level strength NovelAI requires for infill requests.
pub const INPAINT_TOP_LEVEL_STRENGTH: f64 = 1.0;

const DEFAULT_IMG2IMG_STRENGTH: f64 = 0.7;
const DEFAULT_IMG2IMG_NOISE: f64 = 0.0;
const DEFAULT_INPAINT_STRENGTH: f64 = 1.0;

/// Pixel count the variety boost sigma of 19 is calibrated for (832x1216).
const VARIETY_BASE_PIXELS: f64 = 1_011_712.0;
const VARIETY_BASE_SIGMA: f64 = 19.0;

/// Resolve the inpainting variant of a model id. Already-suffixed ids are
/// returned unchanged.
pub fn inpaint_model(model: &str) -> String {
    if model.ends_with(INPAINT_SUFFIX) {
        model.to_string()
    } else {
        format!("{}{}", model, INPAINT_SUFFIX)
    }
}

/// Resolve a seed. Negative values are replaced by a random `u32`-range seed.
pub fn resolve_seed(seed: i64) -> i64 {
    if seed < 0 {
        rand::rng().random_range(0..=u32::MAX as i64)
    } else {
        seed
    }
}

/// Compile a parameter snapshot into a provider request.
///
/// Vibe references are encoded through `encoder`, one call per image, in
/// order. Inpaint requests never encode or carry references.
///
/// # Errors
///
/// - [`CompileError::MissingSourceForMask`] if a mask comes without a source image
/// - [`CompileError::ReferenceEncodingFailed`] if any encode call fails
/// - [`CompileError::ImageDecodeFailed`] if the source, mask or a character
///   reference cannot be decoded
pub async fn compile<E>(
    params: &GenerationParameters,
    encoder: &E,
) -> Result<CompiledRequest, CompileError>
where
    E: ReferenceEncoder,
{
    if params.mask.is_some() && params.source_image.is_none() {
        return Err(CompileError::MissingSourceForMask);
    }

    let mode = params.mode();
    let seed = resolve_seed(params.seed);
    let shared = shared_parameters(params, seed);

    let (model, parameters) = match (mode, &params.source_image, &params.mask) {
        (GenerationMode::Inpaint, Some(source), Some(mask)) => {
            let (width, height) = image_dimensions(source, "source image")?;
            let binary_mask = rasterize_mask(mask, width, height)?;
            let parameters = ModeParameters::Inpaint(InpaintParameters {
                shared,
                image: STANDARD.encode(source),
                mask: STANDARD.encode(binary_mask),
                strength: INPAINT_TOP_LEVEL_STRENGTH,
                inpaint_strength: params.strength.unwrap_or(DEFAULT_INPAINT_STRENGTH),
                add_original_image: true,
            });
            (inpaint_model(&params.model), parameters)
        }
        (GenerationMode::ImageToImage, Some(source), _) => {
            let references = reference_fields(params, encoder).await?;
            let parameters = ModeParameters::ImageToImage(ImageToImageParameters {
                shared,
                references,
                image: STANDARD.encode(source),
                strength: params.strength.unwrap_or(DEFAULT_IMG2IMG_STRENGTH),
                noise: params.noise.unwrap_or(DEFAULT_IMG2IMG_NOISE),
                extra_noise_seed: seed,
            });
            (params.model.clone(), parameters)
        }
        _ => {
            let references = reference_fields(params, encoder).await?;
            let parameters =
                ModeParameters::TextToImage(TextToImageParameters { shared, references });
            (params.model.clone(), parameters)
        }
    };

    debug!(%mode, %model, seed, "compiled generation request");

    Ok(CompiledRequest {
        mode,
        model,
        input: params.prompt.clone(),
        seed,
        parameters,
    })
}

fn shared_parameters(params: &GenerationParameters, seed: i64) -> SharedParameters {
    let characters: Vec<&CharacterCaption> = params
        .characters
        .iter()
        .filter(|c| c.enabled && !c.prompt.trim().is_empty())
        .collect();
    let use_coords = !characters.is_empty();

    let positive_captions = characters
        .iter()
        .map(|c| CharCaption {
            char_caption: c.prompt.clone(),
            centers: vec![c.position],
        })
        .collect();
    let negative_captions = characters
        .iter()
        .map(|c| CharCaption {
            char_caption: c.negative.clone(),
            centers: vec![c.position],
        })
        .collect();
    let character_prompts = characters
        .iter()
        .map(|c| CharacterPrompt {
            prompt: c.prompt.clone(),
            uc: c.negative.clone(),
            center: c.position,
            enabled: true,
        })
        .collect();

    let skip_cfg_above_sigma = params.variety_boost.then(|| {
        let pixels = params.width as f64 * params.height as f64;
        VARIETY_BASE_SIGMA * (pixels / VARIETY_BASE_PIXELS).sqrt()
    });

    SharedParameters {
        params_version: 3,
        width: params.width,
        height: params.height,
        scale: params.cfg_scale,
        sampler: params.sampler.clone(),
        steps: params.steps,
        n_samples: 1,
        seed,
        uc_preset: params.uc_preset,
        quality_toggle: params.quality_toggle,
        dynamic_thresholding: params.decrisp,
        skip_cfg_above_sigma,
        controlnet_strength: 1.0,
        legacy: false,
        legacy_v3_extend: false,
        cfg_rescale: params.cfg_rescale,
        noise_schedule: params.noise_schedule.clone(),
        use_coords,
        negative_prompt: params.negative_prompt.clone(),
        v4_prompt: V4Prompt {
            caption: Caption {
                base_caption: params.prompt.clone(),
                char_captions: positive_captions,
            },
            use_coords,
            use_order: true,
        },
        v4_negative_prompt: V4NegativePrompt {
            caption: Caption {
                base_caption: params.negative_prompt.clone(),
                char_captions: negative_captions,
            },
            legacy_uc: false,
        },
        character_prompts,
        deliberate_euler_ancestral_bug: false,
        prefer_brownian: true,
    }
}

async fn reference_fields<E>(
    params: &GenerationParameters,
    encoder: &E,
) -> Result<ReferenceFields, CompileError>
where
    E: ReferenceEncoder,
{
    let mut fields = ReferenceFields::default();

    for (index, reference) in params.references.iter().enumerate() {
        let encoded = encoder
            .encode_reference(&reference.image, reference.information_extracted, &params.model)
            .await
            .map_err(|e| CompileError::ReferenceEncodingFailed {
                index,
                message: e.to_string(),
            })?;
        fields.reference_image_multiple.push(STANDARD.encode(encoded));
        fields
            .reference_information_extracted_multiple
            .push(reference.information_extracted);
        fields.reference_strength_multiple.push(reference.strength);
    }

    for reference in &params.character_references {
        let boxed = letterbox_reference(&reference.image)?;
        fields.director_reference_images.push(STANDARD.encode(boxed));
        fields
            .director_reference_descriptions
            .push(DirectorDescription::default());
        fields.director_reference_information_extracted.push(1.0);
        fields
            .director_reference_strength_values
            .push(reference.strength);
        fields
            .director_reference_secondary_strength_values
            .push(1.0 - reference.fidelity);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::types::{CharacterReference, ReferenceImage, DEFAULT_MODEL};
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubEncoder {
        calls: AtomicUsize,
        fail_at: Option<usize>,
    }

    impl ReferenceEncoder for StubEncoder {
        async fn encode_reference(
            &self,
            image: &[u8],
            _information_extracted: f64,
            _model: &str,
        ) -> Result<Vec<u8>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(call) {
                return Err(TransportError::Http {
                    status: 500,
                    body: "encode failed".into(),
                });
            }
            let mut out = b"vibe:".to_vec();
            out.extend_from_slice(image);
            Ok(out)
        }
    }

    fn png(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        RgbaImage::from_pixel(width, height, pixel)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn base() -> GenerationParameters {
        GenerationParameters::new("1girl, solo", DEFAULT_MODEL)
            .negative("lowres")
            .seed(1234)
    }

    #[tokio::test]
    async fn test_text_to_image() {
        let req = compile(&base(), &StubEncoder::default()).await.unwrap();
        assert_eq!(req.mode, GenerationMode::TextToImage);
        assert_eq!(req.model, DEFAULT_MODEL);
        assert_eq!(req.seed, 1234);
        let body = req.to_body(false).unwrap();
        assert_eq!(body["parameters"]["seed"], 1234);
        assert_eq!(body["parameters"]["negative_prompt"], "lowres");
        assert!(body["parameters"].get("strength").is_none());
        assert!(body["parameters"].get("image").is_none());
    }

    #[tokio::test]
    async fn test_random_seed_resolved() {
        let req = compile(&base().seed(-1), &StubEncoder::default())
            .await
            .unwrap();
        assert!(req.seed >= 0 && req.seed <= u32::MAX as i64);
        assert_eq!(req.parameters.shared().seed, req.seed);
    }

    #[tokio::test]
    async fn test_image_to_image_carries_strength_and_noise() {
        let params = base()
            .source_image(png(4, 4, Rgba([10, 20, 30, 255])))
            .strength(0.45)
            .noise(0.1);
        let req = compile(&params, &StubEncoder::default()).await.unwrap();
        assert_eq!(req.mode, GenerationMode::ImageToImage);
        let body = req.to_body(false).unwrap();
        assert_eq!(body["action"], "img2img");
        assert_eq!(body["parameters"]["strength"], 0.45);
        assert_eq!(body["parameters"]["noise"], 0.1);
        assert_eq!(body["parameters"]["extra_noise_seed"], 1234);
    }

    #[tokio::test]
    async fn test_image_to_image_defaults() {
        let params = base().source_image(png(4, 4, Rgba([0, 0, 0, 255])));
        let req = compile(&params, &StubEncoder::default()).await.unwrap();
        let body = req.to_body(false).unwrap();
        assert_eq!(body["parameters"]["strength"], 0.7);
        assert_eq!(body["parameters"]["noise"], 0.0);
    }

    #[tokio::test]
    async fn test_mask_without_source_rejected() {
        let params = base().mask(png(4, 4, Rgba([255, 255, 255, 255])));
        let err = compile(&params, &StubEncoder::default()).await.unwrap_err();
        assert!(matches!(err, CompileError::MissingSourceForMask));
    }

    #[tokio::test]
    async fn test_inpaint_drops_references_and_noise() {
        let encoder = StubEncoder::default();
        let params = base()
            .source_image(png(6, 3, Rgba([50, 50, 50, 255])))
            .mask(png(12, 12, Rgba([255, 0, 0, 200])))
            .strength(0.55)
            .noise(0.3)
            .reference(ReferenceImage::new(vec![1, 2, 3]))
            .character_reference(CharacterReference::new(png(4, 4, Rgba([1, 1, 1, 255]))));

        let req = compile(&params, &encoder).await.unwrap();
        assert_eq!(req.mode, GenerationMode::Inpaint);
        assert_eq!(req.model, format!("{}-inpainting", DEFAULT_MODEL));
        assert!(req.parameters.references().is_none());
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);

        let body = req.to_body(false).unwrap();
        let p = body["parameters"].as_object().unwrap();
        assert!(p.keys().all(|k| !k.starts_with("reference_") && !k.starts_with("director_")));
        assert!(!p.contains_key("noise"));
        assert_eq!(p["strength"], 1.0);
        assert_eq!(p["inpaintImg2ImgStrength"], 0.55);
        assert_eq!(body["action"], "infill");

        // mask is rasterized at the source size, not the output size
        let mask = STANDARD.decode(p["mask"].as_str().unwrap()).unwrap();
        let mask = image::load_from_memory(&mask).unwrap();
        assert_eq!((mask.width(), mask.height()), (6, 3));
    }

    #[tokio::test]
    async fn test_inpaint_suffix_idempotent() {
        assert_eq!(inpaint_model("nai-diffusion-4-5-full"), "nai-diffusion-4-5-full-inpainting");
        assert_eq!(
            inpaint_model("nai-diffusion-4-5-full-inpainting"),
            "nai-diffusion-4-5-full-inpainting"
        );
        let params = GenerationParameters::new("p", "nai-diffusion-4-5-full-inpainting")
            .seed(1)
            .source_image(png(2, 2, Rgba([0, 0, 0, 255])))
            .mask(png(2, 2, Rgba([255, 255, 255, 255])));
        let req = compile(&params, &StubEncoder::default()).await.unwrap();
        assert_eq!(req.model, "nai-diffusion-4-5-full-inpainting");
    }

    #[tokio::test]
    async fn test_references_encoded_in_order() {
        let encoder = StubEncoder::default();
        let params = base()
            .reference(ReferenceImage::new(vec![1]).information_extracted(0.5).strength(0.4))
            .reference(ReferenceImage::new(vec![2]));
        let req = compile(&params, &encoder).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);

        let refs = req.parameters.references().unwrap();
        assert_eq!(refs.reference_image_multiple[0], STANDARD.encode(b"vibe:\x01"));
        assert_eq!(refs.reference_image_multiple[1], STANDARD.encode(b"vibe:\x02"));
        assert_eq!(refs.reference_information_extracted_multiple, vec![0.5, 1.0]);
        assert_eq!(refs.reference_strength_multiple, vec![0.4, 0.6]);
    }

    #[tokio::test]
    async fn test_reference_encoding_failure_aborts() {
        let encoder = StubEncoder {
            fail_at: Some(1),
            ..Default::default()
        };
        let params = base()
            .reference(ReferenceImage::new(vec![1]))
            .reference(ReferenceImage::new(vec![2]))
            .reference(ReferenceImage::new(vec![3]));
        let err = compile(&params, &encoder).await.unwrap_err();
        match err {
            CompileError::ReferenceEncodingFailed { index, message } => {
                assert_eq!(index, 1);
                assert!(message.contains("500"));
            }
            other => panic!("Expected ReferenceEncodingFailed, got {:?}", other),
        }
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_character_reference_letterboxed() {
        let params = base().character_reference(
            CharacterReference::new(png(30, 60, Rgba([255, 255, 255, 255]))).fidelity(0.25),
        );
        let req = compile(&params, &StubEncoder::default()).await.unwrap();
        let refs = req.parameters.references().unwrap();
        assert_eq!(refs.director_reference_images.len(), 1);
        assert_eq!(refs.director_reference_secondary_strength_values, vec![0.75]);

        let boxed = STANDARD.decode(&refs.director_reference_images[0]).unwrap();
        let boxed = image::load_from_memory(&boxed).unwrap();
        assert_eq!((boxed.width(), boxed.height()), (1024, 1536));
    }

    #[tokio::test]
    async fn test_character_captions_filtered() {
        let params = base()
            .character(CharacterCaption::new("girl, red hair").negative("bad hands").at(0.3, 0.7))
            .character(CharacterCaption::new("boy").enabled(false))
            .character(CharacterCaption::new("   "));
        let req = compile(&params, &StubEncoder::default()).await.unwrap();
        let body = req.to_body(false).unwrap();
        let p = &body["parameters"];

        assert_eq!(p["use_coords"], true);
        assert_eq!(p["v4_prompt"]["use_coords"], true);
        let captions = p["v4_prompt"]["caption"]["char_captions"].as_array().unwrap();
        assert_eq!(captions.len(), 1);
        assert_eq!(captions[0]["char_caption"], "girl, red hair");
        assert_eq!(captions[0]["centers"][0]["x"], 0.3);
        assert_eq!(captions[0]["centers"][0]["y"], 0.7);
        assert_eq!(
            p["v4_negative_prompt"]["caption"]["char_captions"][0]["char_caption"],
            "bad hands"
        );
        assert_eq!(p["characterPrompts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_characters_no_coords() {
        let req = compile(&base(), &StubEncoder::default()).await.unwrap();
        let shared = req.parameters.shared();
        assert!(!shared.use_coords);
        assert!(shared.v4_prompt.caption.char_captions.is_empty());
    }

    #[tokio::test]
    async fn test_variety_boost_sigma() {
        let req = compile(&base().variety_boost(true), &StubEncoder::default())
            .await
            .unwrap();
        let sigma = req.parameters.shared().skip_cfg_above_sigma.unwrap();
        assert!((sigma - 19.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_undecodable_source_for_inpaint() {
        let params = base()
            .source_image(b"garbage".to_vec())
            .mask(png(2, 2, Rgba([255, 255, 255, 255])));
        let err = compile(&params, &StubEncoder::default()).await.unwrap_err();
        assert!(matches!(err, CompileError::ImageDecodeFailed { .. }));
    }

    #[tokio::test]
    async fn test_oversized_source_for_inpaint() {
        let params = base()
            .source_image(png(crate::mask::MAX_IMAGE_SIDE + 1, 1, Rgba([0, 0, 0, 255])))
            .mask(png(2, 2, Rgba([255, 255, 255, 255])));
        let err = compile(&params, &StubEncoder::default()).await.unwrap_err();
        assert!(matches!(
            err,
            CompileError::ImageDecodeFailed { what: "source image", .. }
        ));
    }
}
