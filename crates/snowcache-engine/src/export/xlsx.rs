//! Streaming XLSX writer
//!
//! The worksheet part is written row by row while the zip entry is open; the
//! small fixed parts (workbook, relationships, styles, chart) follow at
//! [`XlsxWriter::finish`], once the row count is known.

use std::fmt::Write as _;
use std::io::{Seek, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::delimited::{is_plain_number, sanitize_tsv_cell};
use super::{ChartType, ResolvedChart};
use crate::error::Result;

/// Name of the only worksheet
pub const SHEET_NAME: &str = "sheet1";

const NS_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const NS_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const NS_PKG_REL: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const NS_DRAWING: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const NS_CHART: &str = "http://schemas.openxmlformats.org/drawingml/2006/chart";
const NS_SHEET_DRAWING: &str =
    "http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing";

/// Digits Excel keeps exactly; longer numbers stay text
const MAX_NUMERIC_DIGITS: usize = 15;

/// Writes one worksheet, and optionally one chart, into an xlsx container
pub struct XlsxWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
    width: usize,
    chart: Option<ResolvedChart>,
    rows: u64,
    buf: String,
}

impl<W: Write + Seek> XlsxWriter<W> {
    /// Open the container and write the header row
    pub fn new(header: &[String], chart: Option<ResolvedChart>, out: W) -> Result<Self> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(out);
        zip.start_file("xl/worksheets/sheet1.xml", options)?;

        let mut writer = Self {
            zip,
            options,
            width: header.len(),
            chart,
            rows: 0,
            buf: String::with_capacity(1024),
        };

        writer.buf.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        let _ = write!(
            writer.buf,
            r#"<worksheet xmlns="{}" xmlns:r="{}"><sheetData>"#,
            NS_MAIN, NS_REL
        );
        writer.push_row(1, header, true);
        writer.flush_buf()?;
        Ok(writer)
    }

    /// Append one data row
    pub fn write_row(&mut self, row: &[String]) -> Result<()> {
        self.rows += 1;
        let r = self.rows + 1;
        self.push_row(r, row, false);
        if self.buf.len() >= 64 * 1024 {
            self.flush_buf()?;
        }
        Ok(())
    }

    /// Data rows written
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Whether a chart will be embedded
    pub fn has_chart(&self) -> bool {
        self.chart.is_some()
    }

    /// Close the worksheet, write the remaining parts and return the output
    pub fn finish(mut self) -> Result<W> {
        self.buf.push_str("</sheetData>");
        if self.chart.is_some() {
            self.buf.push_str(r#"<drawing r:id="rId1"/>"#);
        }
        self.buf.push_str("</worksheet>");
        self.flush_buf()?;

        let has_chart = self.chart.is_some();
        self.part("[Content_Types].xml", &content_types(has_chart))?;
        self.part("_rels/.rels", &root_rels())?;
        self.part("xl/workbook.xml", &workbook())?;
        self.part("xl/_rels/workbook.xml.rels", &workbook_rels())?;
        self.part("xl/styles.xml", STYLES)?;

        if let Some(chart) = self.chart.take() {
            let last_row = self.rows + 1;
            self.part(
                "xl/worksheets/_rels/sheet1.xml.rels",
                &single_rel(
                    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing",
                    "../drawings/drawing1.xml",
                ),
            )?;
            self.part("xl/drawings/drawing1.xml", &drawing(self.width))?;
            self.part(
                "xl/drawings/_rels/drawing1.xml.rels",
                &single_rel(
                    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/chart",
                    "../charts/chart1.xml",
                ),
            )?;
            self.part("xl/charts/chart1.xml", &chart_xml(&chart, last_row))?;
        }

        Ok(self.zip.finish()?)
    }

    fn push_row(&mut self, r: u64, cells: &[String], header: bool) {
        let _ = write!(self.buf, r#"<row r="{}">"#, r);
        for (i, cell) in cells.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let reference = format!("{}{}", column_letter(i), r);
            if !header && is_numeric_cell(cell) {
                let _ = write!(self.buf, r#"<c r="{}"><v>{}</v></c>"#, reference, cell);
                continue;
            }
            let style = if header { r#" s="1""# } else { "" };
            let _ = write!(
                self.buf,
                r#"<c r="{}"{} t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                reference,
                style,
                escape_xml(&sanitize_tsv_cell(cell))
            );
        }
        self.buf.push_str("</row>");
    }

    fn flush_buf(&mut self) -> Result<()> {
        self.zip.write_all(self.buf.as_bytes())?;
        self.buf.clear();
        Ok(())
    }

    fn part(&mut self, name: &str, body: &str) -> Result<()> {
        self.zip.start_file(name, self.options)?;
        self.zip.write_all(body.as_bytes())?;
        Ok(())
    }
}

/// Spreadsheet column letters: 0 -> A, 25 -> Z, 26 -> AA
pub fn column_letter(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.iter().rev().map(|&b| b as char).collect()
}

fn is_numeric_cell(cell: &str) -> bool {
    if !is_plain_number(cell) {
        return false;
    }
    let unsigned = cell.strip_prefix('-').unwrap_or(cell);
    let int_part = unsigned.split(['.', 'e', 'E']).next().unwrap_or_default();
    // leading zeros mark identifiers such as zip codes
    if int_part.len() > 1 && int_part.starts_with('0') {
        return false;
    }
    let digits = unsigned
        .split(['e', 'E'])
        .next()
        .unwrap_or_default()
        .bytes()
        .filter(u8::is_ascii_digit)
        .count();
    digits <= MAX_NUMERIC_DIGITS
}

/// Escape markup and drop characters XML 1.0 does not allow
fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if is_xml_char(c) => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_xml_char(c: char) -> bool {
    matches!(c as u32, 0x20..=0xD7FF | 0xE000..=0xFFFD | 0x10000..=0x10FFFF)
}

fn content_types(has_chart: bool) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
    xml.push_str(r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#);
    xml.push_str(r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#);
    xml.push_str(r#"<Default Extension="xml" ContentType="application/xml"/>"#);
    xml.push_str(r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#);
    xml.push_str(r#"<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#);
    xml.push_str(r#"<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#);
    if has_chart {
        xml.push_str(r#"<Override PartName="/xl/drawings/drawing1.xml" ContentType="application/vnd.openxmlformats-officedocument.drawing+xml"/>"#);
        xml.push_str(r#"<Override PartName="/xl/charts/chart1.xml" ContentType="application/vnd.openxmlformats-officedocument.drawingml.chart+xml"/>"#);
    }
    xml.push_str("</Types>");
    xml
}

fn single_rel(rel_type: &str, target: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="{}"><Relationship Id="rId1" Type="{}" Target="{}"/></Relationships>"#,
        NS_PKG_REL, rel_type, target
    )
}

fn root_rels() -> String {
    single_rel(
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument",
        "xl/workbook.xml",
    )
}

fn workbook() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="{}" xmlns:r="{}"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        NS_MAIN, NS_REL, SHEET_NAME
    )
}

fn workbook_rels() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="{}"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#,
        NS_PKG_REL
    )
}

// Style 0 is the default, style 1 the bold header.
const STYLES: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
    r#"<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>"#,
    r#"<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>"#,
    r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#,
    r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
    r#"<cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/></cellXfs>"#,
    r#"</styleSheet>"#
);

/// Anchor the chart to the right of the data
fn drawing(width: usize) -> String {
    let from_col = width + 1;
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<xdr:wsDr xmlns:xdr="{sd}" xmlns:a="{a}">"#,
            r#"<xdr:twoCellAnchor>"#,
            r#"<xdr:from><xdr:col>{from}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>1</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>"#,
            r#"<xdr:to><xdr:col>{to}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>21</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to>"#,
            r#"<xdr:graphicFrame macro="">"#,
            r#"<xdr:nvGraphicFramePr><xdr:cNvPr id="2" name="Chart 1"/><xdr:cNvGraphicFramePr/></xdr:nvGraphicFramePr>"#,
            r#"<xdr:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/></xdr:xfrm>"#,
            r#"<a:graphic><a:graphicData uri="{c}"><c:chart xmlns:c="{c}" xmlns:r="{r}" r:id="rId1"/></a:graphicData></a:graphic>"#,
            r#"</xdr:graphicFrame><xdr:clientData/></xdr:twoCellAnchor></xdr:wsDr>"#
        ),
        sd = NS_SHEET_DRAWING,
        a = NS_DRAWING,
        c = NS_CHART,
        r = NS_REL,
        from = from_col,
        to = from_col + 10,
    )
}

fn range(col: usize, first: u64, last: u64) -> String {
    let letter = column_letter(col);
    format!("{}!${}${}:${}${}", SHEET_NAME, letter, first, letter, last)
}

fn rich_text(text: &str) -> String {
    format!(
        r#"<c:tx><c:rich><a:bodyPr/><a:p><a:r><a:t>{}</a:t></a:r></a:p></c:rich></c:tx>"#,
        escape_xml(text)
    )
}

fn axis_title(label: Option<&str>) -> String {
    label
        .map(|l| format!(r#"<c:title>{}<c:overlay val="0"/></c:title>"#, rich_text(l)))
        .unwrap_or_default()
}

fn chart_xml(chart: &ResolvedChart, last_row: u64) -> String {
    let last = last_row.max(2);
    let mut series = String::new();
    for (i, &y) in chart.ys.iter().enumerate() {
        let name = format!("{}!${}$1", SHEET_NAME, column_letter(y));
        let _ = write!(
            series,
            r#"<c:ser><c:idx val="{i}"/><c:order val="{i}"/><c:tx><c:strRef><c:f>{name}</c:f></c:strRef></c:tx>"#,
            i = i,
            name = name
        );
        match chart.chart_type {
            ChartType::Scatter => {
                let _ = write!(
                    series,
                    r#"<c:xVal><c:numRef><c:f>{}</c:f></c:numRef></c:xVal><c:yVal><c:numRef><c:f>{}</c:f></c:numRef></c:yVal><c:smooth val="0"/>"#,
                    range(chart.x, 2, last),
                    range(y, 2, last)
                );
            }
            ChartType::Bar | ChartType::Line => {
                let _ = write!(
                    series,
                    r#"<c:cat><c:strRef><c:f>{}</c:f></c:strRef></c:cat><c:val><c:numRef><c:f>{}</c:f></c:numRef></c:val>"#,
                    range(chart.x, 2, last),
                    range(y, 2, last)
                );
            }
        }
        series.push_str("</c:ser>");
    }

    let axis_ids = r#"<c:axId val="50010"/><c:axId val="50020"/>"#;
    let plot = match chart.chart_type {
        ChartType::Bar => format!(
            r#"<c:barChart><c:barDir val="col"/><c:grouping val="clustered"/><c:varyColors val="0"/>{}{}</c:barChart>"#,
            series, axis_ids
        ),
        ChartType::Line => format!(
            r#"<c:lineChart><c:grouping val="standard"/><c:varyColors val="0"/>{}<c:marker val="1"/>{}</c:lineChart>"#,
            series, axis_ids
        ),
        ChartType::Scatter => format!(
            r#"<c:scatterChart><c:scatterStyle val="lineMarker"/><c:varyColors val="0"/>{}{}</c:scatterChart>"#,
            series, axis_ids
        ),
    };

    let x_title = axis_title(chart.x_label.as_deref());
    let y_title = axis_title(chart.y_label.as_deref());
    let x_axis = match chart.chart_type {
        ChartType::Scatter => format!(
            r#"<c:valAx><c:axId val="50010"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="b"/>{}<c:crossAx val="50020"/></c:valAx>"#,
            x_title
        ),
        ChartType::Bar | ChartType::Line => format!(
            r#"<c:catAx><c:axId val="50010"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="b"/>{}<c:crossAx val="50020"/></c:catAx>"#,
            x_title
        ),
    };
    let y_axis = format!(
        r#"<c:valAx><c:axId val="50020"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="l"/>{}<c:crossAx val="50010"/></c:valAx>"#,
        y_title
    );

    let title = chart
        .title
        .as_deref()
        .map(|t| format!(r#"<c:title>{}<c:overlay val="0"/></c:title><c:autoTitleDeleted val="0"/>"#, rich_text(t)))
        .unwrap_or_default();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<c:chartSpace xmlns:c="{c}" xmlns:a="{a}" xmlns:r="{r}">"#,
            r#"<c:chart>{title}<c:plotArea><c:layout/>{plot}{x_axis}{y_axis}</c:plotArea>"#,
            r#"<c:legend><c:legendPos val="r"/><c:overlay val="0"/></c:legend><c:plotVisOnly val="1"/></c:chart>"#,
            r#"</c:chartSpace>"#
        ),
        c = NS_CHART,
        a = NS_DRAWING,
        r = NS_REL,
        title = title,
        plot = plot,
        x_axis = x_axis,
        y_axis = y_axis,
    )
}
