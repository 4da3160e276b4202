use nom::bytes::complete::{tag, take_until};
use nom::number::complete::{be_u32, be_u64};
use nom::sequence::tuple;
use nom::IResult;

pub const SUPPORTED_FORMATS: [&str; 2] = ["JAVA PROFILE 1.0.1", "JAVA PROFILE 1.0.2"];

// version string + NUL + u32 identifier size + u64 timestamp
pub const FILE_HEADER_LENGTH: usize = SUPPORTED_FORMATS[0].len() + 1 + 4 + 8;

#[derive(Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub format: String,
    pub size_pointers: u32,
    pub timestamp: u64,
}

pub fn parse_file_header(input: &[u8]) -> IResult<&[u8], FileHeader> {
    let (rest, (format, _, size_pointers, timestamp)) =
        tuple((take_until("\0"), tag("\0"), be_u32, be_u64))(input)?;
    let header = FileHeader {
        format: String::from_utf8_lossy(format).into_owned(),
        size_pointers,
        timestamp,
    };
    Ok((rest, header))
}
