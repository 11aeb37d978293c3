use crate::error::FieldFlatError;
use crate::model::Field;
use crate::types::{DESIGN_PAGE_HEIGHT, DESIGN_PAGE_WIDTH, Pt, Rect, Size};
use std::collections::BTreeMap;

/// Page sizes keyed by 1-based page number.
pub type PageSizes = BTreeMap<usize, Size>;

/// Smallest width/height a field occupies on an interactive placement canvas.
pub const MIN_CANVAS_EXTENT: f64 = 20.0;

/// Flips a top-left-origin rect onto a bottom-left-origin page. Only the vertical axis
/// moves; every coordinate is rounded to hundredths of a point.
pub fn to_page_space(rect: Rect, page_height: Pt) -> Rect {
    Rect {
        x: rect.x,
        y: page_height - rect.top(),
        width: rect.width,
        height: rect.height,
    }
    .rounded()
}

/// Scales design-space geometry onto an on-screen canvas of arbitrary size. Used for
/// interactive placement only, never for painting.
pub fn to_canvas_space(rect: Rect, canvas_width: f64, canvas_height: f64) -> Rect {
    let scale_x = canvas_width / DESIGN_PAGE_WIDTH;
    let scale_y = canvas_height / DESIGN_PAGE_HEIGHT;
    Rect::new(
        rect.x.to_f64() * scale_x,
        rect.y.to_f64() * scale_y,
        (rect.width.to_f64() * scale_x).max(MIN_CANVAS_EXTENT),
        (rect.height.to_f64() * scale_y).max(MIN_CANVAS_EXTENT),
    )
}

pub fn page_size_for(field: &Field, pages: &PageSizes) -> Result<Size, FieldFlatError> {
    usize::try_from(field.page_number)
        .ok()
        .and_then(|page| pages.get(&page))
        .copied()
        .ok_or_else(|| FieldFlatError::PageOutOfRange {
            field_id: field.id.clone(),
            page_number: field.page_number,
            page_count: pages.len(),
        })
}

/// Page-space rect of `field` on its page.
pub fn page_rect_for(field: &Field, pages: &PageSizes) -> Result<Rect, FieldFlatError> {
    let size = page_size_for(field, pages)?;
    Ok(to_page_space(field.design_rect(), size.height))
}

/// Fails on the first field whose page is not in `pages`.
pub fn validate_pages<'a>(
    fields: impl IntoIterator<Item = &'a Field>,
    pages: &PageSizes,
) -> Result<(), FieldFlatError> {
    for field in fields {
        page_size_for(field, pages)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    fn pages(count: usize) -> PageSizes {
        (1..=count).map(|n| (n, Size::design_page())).collect()
    }

    #[test]
    fn flips_the_vertical_axis() {
        let rect = to_page_space(Rect::new(0.0, 0.0, 100.0, 50.0), Pt::from_f64(842.0));
        assert_eq!(rect, Rect::new(0.0, 792.0, 100.0, 50.0));

        let rect = to_page_space(Rect::new(72.0, 700.0, 120.0, 42.0), Pt::from_f64(842.0));
        assert_eq!(rect.y.to_f64(), 100.0);
        assert_eq!(rect.x.to_f64(), 72.0);
    }

    #[test]
    fn page_space_rounds_to_hundredths() {
        let rect = to_page_space(
            Rect::new(10.123, 20.456, 30.789, 40.001),
            Pt::from_f64(792.0),
        );
        assert_eq!(rect.x.to_milli_i64(), 10_120);
        assert_eq!(rect.y.to_milli_i64(), 731_540);
        assert_eq!(rect.width.to_milli_i64(), 30_790);
        assert_eq!(rect.height.to_milli_i64(), 40_000);
    }

    #[test]
    fn canvas_space_scales_and_floors_small_fields() {
        let rect = to_canvas_space(Rect::new(59.5, 84.2, 119.0, 5.0), 1190.0, 1684.0);
        assert_eq!(rect.x.to_f64(), 119.0);
        assert_eq!(rect.y.to_milli_i64(), 168_400);
        assert_eq!(rect.width.to_f64(), 238.0);
        assert_eq!(rect.height.to_f64(), MIN_CANVAS_EXTENT);
    }

    #[test]
    fn out_of_range_pages_are_errors() {
        let pages = pages(2);
        let field = Field::new("sig", FieldType::Signature).with_geometry(3, 0.0, 0.0, 10.0, 10.0);
        match page_size_for(&field, &pages) {
            Err(FieldFlatError::PageOutOfRange {
                page_number,
                page_count,
                ..
            }) => {
                assert_eq!(page_number, 3);
                assert_eq!(page_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        let zero = Field::new("z", FieldType::Text).with_geometry(0, 0.0, 0.0, 1.0, 1.0);
        assert!(page_size_for(&zero, &pages).is_err());
        let negative = Field::new("n", FieldType::Text).with_geometry(-1, 0.0, 0.0, 1.0, 1.0);
        assert!(validate_pages([&negative], &pages).is_err());
    }

    #[test]
    fn page_rect_uses_the_fields_own_page() {
        let mut pages = pages(1);
        pages.insert(2, Size::letter());
        let field = Field::new("t", FieldType::Text).with_geometry(2, 10.0, 10.0, 50.0, 20.0);
        let rect = page_rect_for(&field, &pages).expect("rect");
        assert_eq!(rect.y.to_f64(), 762.0);
    }
}
