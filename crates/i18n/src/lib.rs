use std::collections::BTreeMap;

use core_types::UiLanguage;

#[derive(Debug, Clone)]
pub struct I18n {
    lang: UiLanguage,
    zh_cn: BTreeMap<&'static str, &'static str>,
    en_us: BTreeMap<&'static str, &'static str>,
}

impl I18n {
    pub fn new(lang: UiLanguage) -> Self {
        Self {
            lang,
            zh_cn: zh_cn_map(),
            en_us: en_us_map(),
        }
    }

    pub fn set_language(&mut self, lang: UiLanguage) {
        self.lang = lang;
    }

    pub fn language(&self) -> UiLanguage {
        self.lang
    }

    pub fn t<'a>(&'a self, key: &'a str) -> &'a str {
        let (primary, fallback) = match self.lang {
            UiLanguage::ZhCn => (&self.zh_cn, &self.en_us),
            UiLanguage::EnUs => (&self.en_us, &self.zh_cn),
        };
        primary
            .get(key)
            .or_else(|| fallback.get(key))
            .copied()
            .unwrap_or(key)
    }

    /// Like [`I18n::t`], substituting `{name}` placeholders.
    pub fn tr(&self, key: &str, params: &[(&str, &str)]) -> String {
        params
            .iter()
            .fold(self.t(key).to_string(), |text, (name, value)| {
                text.replace(&format!("{{{name}}}"), value)
            })
    }
}

fn zh_cn_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("session.required", "请先登录"),
        ("graph.load_failed", "加载图谱失败：{error}"),
        ("note.created", "已创建笔记“{title}”"),
        ("note.create_failed", "创建笔记失败：{error}"),
        ("note.saved", "笔记已保存"),
        ("note.save_failed", "保存笔记失败：{error}"),
        ("note.deleted", "笔记已删除"),
        ("note.delete_failed", "删除笔记失败：{error}"),
        ("file.uploaded", "已上传文件“{filename}”"),
        ("file.upload_failed", "上传文件失败：{error}"),
        ("file.deleted", "文件已删除"),
        ("file.delete_failed", "删除文件失败：{error}"),
        ("node.missing", "画布上找不到该节点"),
        ("node.position_failed", "保存节点位置失败：{error}"),
        ("edge.created", "已创建连线"),
        ("edge.create_failed", "创建连线失败：{error}"),
        ("edge.invalid", "无效的连线：{error}"),
        ("edge.deleted", "连线已删除"),
        ("edge.delete_failed", "删除连线失败：{error}"),
        ("edge.relabeled", "连线标签已更新"),
        ("edge.relabel_failed", "更新连线标签失败：{error}"),
        ("search.results", "找到 {count} 条相关笔记"),
        ("search.failed", "搜索失败：{error}"),
        ("ask.failed", "提问失败：{error}"),
    ])
}

fn en_us_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("session.required", "Please log in first"),
        ("graph.load_failed", "Failed to load graph: {error}"),
        ("note.created", "Created note \"{title}\""),
        ("note.create_failed", "Failed to create note: {error}"),
        ("note.saved", "Note saved"),
        ("note.save_failed", "Failed to save note: {error}"),
        ("note.deleted", "Note deleted"),
        ("note.delete_failed", "Failed to delete note: {error}"),
        ("file.uploaded", "Uploaded \"{filename}\""),
        ("file.upload_failed", "Failed to upload file: {error}"),
        ("file.deleted", "File deleted"),
        ("file.delete_failed", "Failed to delete file: {error}"),
        ("node.missing", "That node is not on the canvas"),
        ("node.position_failed", "Failed to save node position: {error}"),
        ("edge.created", "Connection created"),
        ("edge.create_failed", "Failed to create connection: {error}"),
        ("edge.invalid", "Invalid connection: {error}"),
        ("edge.deleted", "Connection deleted"),
        ("edge.delete_failed", "Failed to delete connection: {error}"),
        ("edge.relabeled", "Connection label updated"),
        ("edge.relabel_failed", "Failed to update connection label: {error}"),
        ("search.results", "Found {count} matching notes"),
        ("search.failed", "Search failed: {error}"),
        ("ask.failed", "Question failed: {error}"),
    ])
}
