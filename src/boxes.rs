// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        /// Box types known to the parser.
        ///
        /// Anything else is carried as [`BoxType::UnknownBox`] with its raw code.
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    }
}

/// Big-endian integer form of a four character code, as used for box type comparisons.
#[must_use]
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

/// A four character code, stored as raw bytes.
#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    /// The code as a big-endian integer.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.value)
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => fmt::Debug::fmt(&self.value, f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    FreeSpaceBox                      0x6672_6565, // "free"
    MovieBox                          0x6d6f_6f76, // "moov"
    TrackBox                          0x7472_616b, // "trak"
    MediaBox                          0x6d64_6961, // "mdia"
    MediaInformationBox               0x6d69_6e66, // "minf"
    SampleTableBox                    0x7374_626c, // "stbl"
    DataInformationBox                0x6469_6e66, // "dinf"
    DataReferenceBox                  0x6472_6566, // "dref"
    MetadataBox                       0x6d65_7461, // "meta"
    HandlerBox                        0x6864_6c72, // "hdlr"
    PrimaryItemBox                    0x7069_746d, // "pitm"
    ItemInfoBox                       0x6969_6e66, // "iinf"
    ItemInfoEntry                     0x696e_6665, // "infe"
    ItemLocationBox                   0x696c_6f63, // "iloc"
    ItemDataBox                       0x6964_6174, // "idat"
    ImageReferenceBox                 0x6972_6566, // "iref"
    ImagePropertiesBox                0x6970_7270, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, // "ipma"
    HevcConfigurationBox              0x6876_6343, // "hvcC"
    ImageSpatialExtentsBox            0x6973_7065, // "ispe"
    PixelInformationBox               0x7069_7869, // "pixi"
    AuxiliaryTypeProperty             0x6175_7843, // "auxC"
    ColourInformationBox              0x636f_6c72, // "colr"
    ImageRotation                     0x6972_6f74, // "irot"
    ImageMirror                       0x696d_6972, // "imir"
    CleanApertureBox                  0x636c_6170, // "clap"
    UuidBox                           0x7575_6964, // "uuid"
);
