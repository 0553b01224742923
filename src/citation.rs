//! Citation enrichment.
//!
//! Derives a lightweight citation for each chunk from the chunk's own
//! position and the parsed document's page metadata. Pure: absence of a page
//! render simply yields a citation without one.

use crate::models::{Chunk, Citation, ParsedDocument};

/// Build the citation for one chunk. The preview URL names the read path an
/// HTTP layer can serve cached renders from; `render_path` points at the
/// render on disk when the parse produced one for this page.
pub fn enrich(chunk: &Chunk, parsed: &ParsedDocument) -> Citation {
    let render_path = parsed
        .page(chunk.page_number)
        .and_then(|page| page.render.as_ref())
        .map(|path| path.display().to_string());

    Citation {
        label: format!("p{}#{}", chunk.page_number, chunk.page_index + 1),
        page_number: chunk.page_number,
        preview_url: format!(
            "/documents/{}/pages/{}/preview",
            chunk.document_id, chunk.page_number
        ),
        render_path,
    }
}
