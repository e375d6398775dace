//! Canonical ophthalmic modalities and the rule table that maps raw
//! device tags onto them.
//!
//! Classification is a pure function of [`DeviceTags`]: an ordered list of
//! [`ModalityRule`]s is evaluated top to bottom and the first rule whose
//! conditions all hold wins. User supplied rules are placed in front of
//! the built-in table, so new device quirks are additive.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Properties of a modality, combined with `|`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModalityFlags(u8);

impl ModalityFlags {
    pub const NONE: Self = Self(0);
    pub const COLOUR: Self = Self(1);
    pub const IMAGE_2D: Self = Self(1 << 1);
    pub const ANTERIOR: Self = Self(1 << 2);
    pub const INTERIOR: Self = Self(1 << 3);
    /// May contain identifiable content (faces, burnt-in text).
    pub const SENSITIVE: Self = Self(1 << 4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ModalityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

macro_rules! modalities {
    ($($variant:ident => ($code:literal, $description:literal, $flags:expr)),+ $(,)?) => {
        /// Imaging technique an instance was captured with.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub enum Modality {
            $($variant),+
        }

        impl Modality {
            pub const ALL: &'static [Modality] = &[$(Modality::$variant),+];

            /// Short code, used in exported file names.
            pub fn code(self) -> &'static str {
                match self {
                    $(Modality::$variant => $code),+
                }
            }

            pub fn description(self) -> &'static str {
                match self {
                    $(Modality::$variant => $description),+
                }
            }

            pub fn flags(self) -> ModalityFlags {
                match self {
                    $(Modality::$variant => $flags),+
                }
            }
        }
    };
}

const IMG: ModalityFlags = ModalityFlags::IMAGE_2D;
const IMG_IN: ModalityFlags = ModalityFlags(ModalityFlags::IMAGE_2D.0 | ModalityFlags::INTERIOR.0);

modalities! {
    ColourPhoto => ("CP", "Colour Photo", IMG | ModalityFlags::COLOUR),
    InfraredPhoto => ("IRP", "Infrared Photo", IMG),
    SloRed => ("SLO_R", "SLO - Red", IMG_IN),
    SloGreen => ("SLO_G", "SLO - Green", IMG_IN),
    SloBlue => ("SLO_B", "SLO - Blue", IMG_IN),
    SloInfrared => ("SLO_IR", "SLO - Infrared", IMG_IN),
    SloInfraredCrossPolarized => ("SLO_IR_XP", "SLO - Infrared (cross-polarized)", IMG_IN),
    FluoresceinAngiography => ("FA", "FA", IMG_IN),
    IndocyanineGreenAngiography => ("ICGA", "ICGA", IMG_IN),
    RedFree => ("RF", "Red-free", IMG_IN),
    RedFreeCrossPolarized => ("RF_XP", "Red-free (cross-polarized)", IMG_IN),
    FaIcga => ("FA+ICGA", "FA+ICGA", IMG_IN),
    AutofluorescenceBlue => ("AF_B", "AF - Blue", IMG_IN),
    AutofluorescenceGreen => ("AF_G", "AF - Green", IMG_IN),
    AutofluorescenceInfrared => ("AF_IR", "AF - Infrared", IMG_IN),
    ReflectanceRed => ("REF_R", "Reflectance - Red", IMG),
    ReflectanceGreen => ("REF_G", "Reflectance - Green", IMG),
    ReflectanceBlue => ("REF_B", "Reflectance - Blue", IMG),
    ReflectanceBlueCrossPolarized => ("REF_B_XP", "Reflectance - Blue (cross-polarized)", IMG),
    ReflectanceInfrared => ("REF_IR", "Reflectance - Infrared", IMG),
    ReflectanceMultiColor => ("MCR", "Multi Color Reflectance - RGB", IMG),
    Oct => ("OCT", "OCT", ModalityFlags::NONE),
    CorneaMicroscopy => ("CM", "Cornea Microscopy", ModalityFlags::NONE),
    Mpod => ("MPOD", "MP Optical Density", ModalityFlags::NONE),
    HrTomography => ("HRT", "HR Tomography", ModalityFlags::NONE),
    SlitLamp => ("SLIT", "Slit Lamp", IMG | ModalityFlags::ANTERIOR),
    Red => ("RED", "Red", IMG_IN),
    FacePhoto => ("FACE", "Face photo", IMG | ModalityFlags::ANTERIOR | ModalityFlags::SENSITIVE),
    PseudocolourUltrawidefield => (
        "PCUWF",
        "Pseudocolour Ultra-widefield",
        IMG_IN | ModalityFlags::COLOUR
    ),
    OptosFa => ("OPTOS_FA", "Optos Ultra-Widefield FA", IMG_IN),
    FlickerDefinedForm => ("FDF", "Flicker Defined Form Perimetry", ModalityFlags::NONE),
    StandardAutomatedPerimetry => ("SAP", "Standard Automated Perimetry", ModalityFlags::NONE),
    MpodResult => ("MPODR", "MP Optical Density Result", ModalityFlags::NONE),
    Thickness => ("T", "Thickness", ModalityFlags::NONE),
    CellAnalysis => ("CELL", "Cell Analysis", ModalityFlags::NONE),
    EncapsulatedPdf => ("PDF", "PDF", ModalityFlags::SENSITIVE),
    Unknown => ("UNKNOWN", "Unknown", ModalityFlags::SENSITIVE),
}

impl Modality {
    pub fn is_2d_image(self) -> bool {
        self.flags().contains(ModalityFlags::IMAGE_2D)
    }

    pub fn is_anterior(self) -> bool {
        self.flags().contains(ModalityFlags::ANTERIOR)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Modality {
    type Err = String;

    /// Accepts either the short code or the description, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Modality::ALL
            .iter()
            .copied()
            .find(|m| m.code().eq_ignore_ascii_case(s) || m.description().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown modality '{s}'"))
    }
}

impl From<Modality> for String {
    fn from(m: Modality) -> String {
        m.code().to_string()
    }
}

impl TryFrom<String> for Modality {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The raw header values the classifier looks at.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceTags {
    pub modality: String,
    pub manufacturer: String,
    pub model: String,
    pub series_description: String,
    pub field_of_view: Option<f64>,
}

/// A single predicate over [`DeviceTags`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// Raw Modality (0008,0060), case-insensitive equality.
    ModalityIs(String),
    ManufacturerIs(String),
    ManufacturerContains(String),
    /// Substring of SeriesDescription, case-sensitive: the vendor markers
    /// rely on surrounding spaces and exact casing (" FA ", " MColor ").
    DescriptionContains(String),
    /// Case-insensitive substring of either the model name or the series
    /// description.
    ModelContains(String),
    FieldOfView(f64),
}

impl Condition {
    fn holds(&self, tags: &DeviceTags) -> bool {
        match self {
            Condition::ModalityIs(m) => tags.modality.trim().eq_ignore_ascii_case(m),
            Condition::ManufacturerIs(m) => tags.manufacturer.trim().eq_ignore_ascii_case(m),
            Condition::ManufacturerContains(m) => tags
                .manufacturer
                .to_ascii_uppercase()
                .contains(&m.to_ascii_uppercase()),
            Condition::DescriptionContains(d) => tags.series_description.contains(d.as_str()),
            Condition::ModelContains(needle) => {
                let needle = needle.to_ascii_uppercase();
                tags.model.to_ascii_uppercase().contains(&needle)
                    || tags.series_description.to_ascii_uppercase().contains(&needle)
            }
            Condition::FieldOfView(fov) => tags
                .field_of_view
                .is_some_and(|v| (v - fov).abs() < 1e-6),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModalityRule {
    pub modality: Modality,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ModalityRule {
    pub fn new(modality: Modality, conditions: Vec<Condition>) -> Self {
        Self {
            modality,
            conditions,
        }
    }

    fn matches(&self, tags: &DeviceTags) -> bool {
        self.conditions.iter().all(|c| c.holds(tags))
    }
}

fn op(extra: Vec<Condition>) -> Vec<Condition> {
    let mut conditions = vec![Condition::ModalityIs("OP".into())];
    conditions.extend(extra);
    conditions
}

fn op_description(marker: &str, modality: Modality) -> ModalityRule {
    ModalityRule::new(modality, op(vec![Condition::DescriptionContains(marker.into())]))
}

/// Built-in rule table, in precedence order.
pub fn default_rules() -> Vec<ModalityRule> {
    use Condition::*;
    use Modality::*;

    vec![
        ModalityRule::new(Oct, vec![ModalityIs("OPT".into())]),
        ModalityRule::new(ColourPhoto, op(vec![ManufacturerIs("TOPCON".into())])),
        ModalityRule::new(
            OptosFa,
            op(vec![ManufacturerContains("OPTOS".into()), DescriptionContains(" FA".into())]),
        ),
        ModalityRule::new(
            AutofluorescenceGreen,
            op(vec![ManufacturerContains("OPTOS".into()), DescriptionContains(" AF".into())]),
        ),
        ModalityRule::new(
            PseudocolourUltrawidefield,
            op(vec![ManufacturerIs("OPTOS".into()), FieldOfView(200.0)]),
        ),
        ModalityRule::new(PseudocolourUltrawidefield, op(vec![ModelContains("OPTOMAP".into())])),
        op_description(" IR", SloInfrared),
        op_description(" BAF ", AutofluorescenceBlue),
        op_description(" ICGA ", IndocyanineGreenAngiography),
        op_description(" FA&ICGA ", FaIcga),
        op_description(" FA ", FluoresceinAngiography),
        op_description(" RF ", RedFree),
        op_description(" BR ", ReflectanceBlue),
        op_description(" MColor ", ReflectanceMultiColor),
    ]
}

/// Compiled, immutable classification policy shared by every worker.
#[derive(Clone, Debug)]
pub struct Classifier {
    rules: Vec<ModalityRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Classifier {
    /// `extra` rules take precedence over the built-in table.
    pub fn new(extra: Vec<ModalityRule>) -> Self {
        let mut rules = extra;
        rules.extend(default_rules());
        Self { rules }
    }

    /// Reads extra rules from a JSON array of [`ModalityRule`].
    pub fn from_rules_file(path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::Rules {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        let extra: Vec<ModalityRule> = serde_json::from_str(&text).map_err(|e| err(e.to_string()))?;
        Ok(Self::new(extra))
    }

    /// `None` when the raw modality is empty: such instances carry no
    /// usable image and are filtered out. Any other value that no rule
    /// recognises becomes [`Modality::Unknown`].
    pub fn classify(&self, tags: &DeviceTags) -> Option<Modality> {
        if tags.modality.trim().is_empty() {
            return None;
        }
        let modality = self
            .rules
            .iter()
            .find(|rule| rule.matches(tags))
            .map(|rule| rule.modality)
            .unwrap_or(Modality::Unknown);
        Some(modality)
    }
}
